//! Probe configuration shared between the loader and the BPF object.
//!
//! The loader resolves names into the numeric tags of [`ProbeConfig`] once,
//! before the object is loaded, and writes the table into the `PROBE_CONFIG`
//! global. The probes only ever decode tags; they never resolve names.

/// Marks an unused argument slot in [`ProbeConfig`].
pub const NO_ARG: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ArgType {
    Int = 1,
    U32 = 2,
    S64 = 3,
    U64 = 4,
    SizeT = 5,
    SsizeT = 6,
}

impl ArgType {
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(ArgType::Int),
            2 => Some(ArgType::U32),
            3 => Some(ArgType::S64),
            4 => Some(ArgType::U64),
            5 => Some(ArgType::SizeT),
            6 => Some(ArgType::SsizeT),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" | "i32" => Some(ArgType::Int),
            "u32" | "uint" => Some(ArgType::U32),
            "s64" | "i64" | "long" => Some(ArgType::S64),
            "u64" | "ulong" => Some(ArgType::U64),
            "size_t" => Some(ArgType::SizeT),
            "ssize_t" => Some(ArgType::SsizeT),
            _ => None,
        }
    }

    pub const fn width(self) -> usize {
        match self {
            ArgType::Int | ArgType::U32 => 4,
            ArgType::S64 | ArgType::U64 | ArgType::SizeT | ArgType::SsizeT => 8,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, ArgType::Int | ArgType::S64 | ArgType::SsizeT)
    }
}

/// Which buffered argument, if any, is copied after the return value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum CaptureShape {
    #[default]
    None = 0,
    /// A single buffer whose length is the return value.
    CharBuf = 1,
    /// An array of `struct iovec`, gathered in order.
    CharIovec = 2,
}

impl CaptureShape {
    pub const fn from_tag(tag: u32) -> Self {
        match tag {
            1 => CaptureShape::CharBuf,
            2 => CaptureShape::CharIovec,
            _ => CaptureShape::None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CaptureShape::None),
            "char_buf" | "buffer" => Some(CaptureShape::CharBuf),
            "char_iovec" | "iovec" => Some(CaptureShape::CharIovec),
            _ => None,
        }
    }
}

/// Constant table written into the BPF object before load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ProbeConfig {
    pub probe_id: u32,
    /// [`ArgType`] tag, `0` when the return value is not captured.
    pub return_type: u32,
    pub capture_shape: u32,
    /// Entry argument index holding the buffer pointer, or [`NO_ARG`].
    pub buffer_arg: u32,
    /// Entry argument index holding the segment count, or [`NO_ARG`].
    pub count_arg: u32,
}

impl ProbeConfig {
    pub const UNSET: ProbeConfig = ProbeConfig {
        probe_id: 0,
        return_type: 0,
        capture_shape: 0,
        buffer_arg: NO_ARG,
        count_arg: NO_ARG,
    };

    pub const fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            probe_id: self.probe_id,
            return_type: ArgType::from_tag(self.return_type),
            shape: CaptureShape::from_tag(self.capture_shape),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::UNSET
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureConfig {
    pub probe_id: u32,
    pub return_type: Option<ArgType>,
    pub shape: CaptureShape,
}
