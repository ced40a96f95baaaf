//! H.264 NAL unit classification.
//!
//! The capture collaborator delivers timestamped access units; this module
//!  tells keyframes (IDR slices) from regular slices and recognizes parameter
//!  sets, which are retained out-of-band for the container's decoder
//!  configuration record instead of being pushed as samples.

/// NAL unit types (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Forward-compatible: anything this pipeline has no special handling for
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    /// Check if this NAL unit type indicates a keyframe
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    /// Check if this is a parameter set (SPS/PPS)
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// Type of the first NAL unit in an access unit, looking through an optional
///  Annex B start code (3 or 4 bytes). `None` for an empty buffer.
pub fn leading_nal_type(data: &[u8]) -> Option<NalUnitType> {
    let data = strip_start_code(data);
    data.first().map(|&header| NalUnitType::from(header))
}

/// The access unit without its Annex B start code, if it carried one.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}
