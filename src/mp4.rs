//! Minimal ISOBMFF box scan used to locate the `moov` atom.
//!
//! MP4 playback cannot start until the player has read `moov`. Fast-start
//! files carry it up front; most encoders write it at the end, in which case
//! the proxy prefetches the file tail alongside the head.

/// Where the `moov` atom sits within an MP4 container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoovPosition {
    /// Not yet probed, or the media is not MP4.
    #[default]
    Unknown,
    /// `moov` precedes the media data; no tail prefetch needed.
    AtStart,
    /// `moov` trails the media data (or we could not tell).
    AtEnd,
}

/// Box types that may legally precede either `moov` or `mdat` and carry no
/// media data themselves.
const SKIPPABLE: [&[u8; 4]; 4] = [b"ftyp", b"free", b"skip", b"wide"];

/// Decoded header of one top-level box.
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// Total box size including the header itself.
    size: u64,
    fourcc: [u8; 4],
    header_len: usize,
}

impl BoxHeader {
    /// Decode the box header at the front of `remaining`.
    ///
    /// A size field of 1 switches to the 64-bit extended form; 0 means the
    /// box runs to the end of the file.
    fn decode(remaining: &[u8]) -> Option<Self> {
        let base: &[u8; 8] = remaining.first_chunk()?;
        let fourcc = [base[4], base[5], base[6], base[7]];

        match u32::from_be_bytes([base[0], base[1], base[2], base[3]]) {
            1 => {
                let ext: &[u8; 8] = remaining.get(8..16)?.try_into().ok()?;
                Some(Self {
                    size: u64::from_be_bytes(*ext),
                    fourcc,
                    header_len: 16,
                })
            }
            0 => Some(Self {
                size: remaining.len() as u64,
                fourcc,
                header_len: 8,
            }),
            size32 => Some(Self {
                size: size32 as u64,
                fourcc,
                header_len: 8,
            }),
        }
    }

    /// Whether the declared size can even hold the header.
    fn is_well_formed(&self) -> bool {
        self.size >= self.header_len as u64
    }
}

/// Classify the `moov` position from the leading bytes of a file.
///
/// Walks top-level boxes from offset 0, stepping by each box's declared size.
/// The first non-skippable box decides: `moov` means fast-start, anything
/// else (typically `mdat`) means the metadata trails the media data. Running
/// out of data is treated as at-end, which errs toward prefetching the tail.
pub fn detect_moov_position(leading: &[u8]) -> MoovPosition {
    let mut offset: usize = 0;

    while offset < leading.len() {
        let Some(header) = BoxHeader::decode(&leading[offset..]) else {
            return MoovPosition::AtEnd;
        };

        if &header.fourcc == b"moov" {
            return MoovPosition::AtStart;
        }
        if !SKIPPABLE.contains(&&header.fourcc) || !header.is_well_formed() {
            return MoovPosition::AtEnd;
        }

        match offset.checked_add(header.size as usize) {
            Some(next) => offset = next,
            None => return MoovPosition::AtEnd,
        }
    }

    MoovPosition::AtEnd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(fourcc: &[u8; 4], body_len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(body_len + 8).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend(std::iter::repeat_n(0u8, body_len as usize));
        out
    }

    #[test]
    fn moov_after_ftyp_is_at_start() {
        let mut data = atom(b"ftyp", 16);
        data.extend(atom(b"moov", 24));
        assert_eq!(detect_moov_position(&data), MoovPosition::AtStart);
    }

    #[test]
    fn mdat_after_ftyp_is_at_end() {
        let mut data = atom(b"ftyp", 16);
        data.extend(atom(b"mdat", 24));
        assert_eq!(detect_moov_position(&data), MoovPosition::AtEnd);
    }

    #[test]
    fn free_boxes_are_skipped() {
        let mut data = atom(b"ftyp", 8);
        data.extend(atom(b"free", 4));
        data.extend(atom(b"moov", 16));
        assert_eq!(detect_moov_position(&data), MoovPosition::AtStart);
    }

    #[test]
    fn truncated_header_defaults_to_at_end() {
        // ftyp whose declared size runs past the captured bytes, followed by
        // nothing: the walk cannot reach a verdict.
        let data = atom(b"ftyp", 200);
        assert_eq!(detect_moov_position(&data[..24]), MoovPosition::AtEnd);
    }

    #[test]
    fn empty_input_defaults_to_at_end() {
        assert_eq!(detect_moov_position(&[]), MoovPosition::AtEnd);
    }

    #[test]
    fn extended_size_header_is_understood() {
        // 64-bit size box: size field == 1, real size in the next 8 bytes.
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend(std::iter::repeat_n(0u8, 8));
        data.extend(atom(b"moov", 8));
        assert_eq!(detect_moov_position(&data), MoovPosition::AtStart);
    }
}
