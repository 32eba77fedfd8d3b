//! Resolves the user-facing probe description into the constant table the BPF
//! object reads. This runs once, before load.

use anyhow::{bail, Context as _};
use kretsnoop_common::{config::NO_ARG, ArgType, CaptureShape, ProbeConfig};

/// The entry probe only reads register-passed arguments.
pub const MAX_ENTRY_ARGS: u32 = 5;

#[derive(Clone, Debug)]
pub struct ProbeSpec {
    pub function: String,
    pub probe_id: u32,
    pub return_type: Option<String>,
    pub capture: String,
    pub buffer_arg: Option<u32>,
    pub count_arg: Option<u32>,
}

impl ProbeSpec {
    pub fn resolve(&self) -> anyhow::Result<ProbeConfig> {
        if self.function.trim().is_empty() {
            bail!("no function to probe");
        }

        let return_type = match self.return_type.as_deref() {
            None => 0,
            Some(name) => {
                ArgType::from_name(name).with_context(|| format!("unknown return type `{name}`"))?
                    as u32
            }
        };
        let shape = CaptureShape::from_name(&self.capture)
            .with_context(|| format!("unknown capture shape `{}`", self.capture))?;
        let buffer_arg = arg_index("buffer", self.buffer_arg)?;
        let count_arg = arg_index("count", self.count_arg)?;

        match shape {
            CaptureShape::CharBuf if buffer_arg == NO_ARG => {
                bail!("`char_buf` capture of {} needs a buffer argument", self.function)
            }
            CaptureShape::CharIovec if buffer_arg == NO_ARG || count_arg == NO_ARG => {
                bail!(
                    "`char_iovec` capture of {} needs buffer and count arguments",
                    self.function
                )
            }
            _ => {}
        }

        Ok(ProbeConfig {
            probe_id: self.probe_id,
            return_type,
            capture_shape: shape as u32,
            buffer_arg,
            count_arg,
        })
    }
}

fn arg_index(what: &str, index: Option<u32>) -> anyhow::Result<u32> {
    match index {
        None => Ok(NO_ARG),
        Some(i) if i < MAX_ENTRY_ARGS => Ok(i),
        Some(i) => bail!(
            "{what} argument index {i} out of range (0..{})",
            MAX_ENTRY_ARGS
        ),
    }
}

/// Whether `function` is a symbol of the running kernel, given the contents
/// of `/proc/kallsyms`.
pub fn kallsyms_has(kallsyms: &str, function: &str) -> bool {
    kallsyms
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .any(|name| name == function)
}
