use std::process::Command;

use anyhow::Context as _;

use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(default_value = "bpfel-unknown-none", long, value_enum)]
    pub bpf_target: Architecture,

    #[clap(long)]
    pub release: bool,

    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,

    /// Arguments passed to kretsnoop, e.g. `-- -f vfs_read -r ssize_t -c char_buf --buffer-arg 1`
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

fn build(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build"];
    if opts.release {
        args.push("--release")
    }
    let status = Command::new("cargo").args(&args).status()?;
    if !status.success() {
        anyhow::bail!("failed to build userspace: {status}");
    }
    Ok(())
}

pub fn run(opts: Options) -> Result<(), anyhow::Error> {
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })
    .context("Error while building eBPF program")?;
    build(&opts).context("Error while building userspace application")?;

    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{profile}/kretsnoop");
    let object = format!("target/{}/{profile}/kretsnoop", opts.bpf_target.target());

    let mut args: Vec<_> = opts.runner.trim().split_terminator(' ').collect();
    args.push(bin_path.as_str());
    args.push("--object");
    args.push(object.as_str());
    args.extend(opts.run_args.iter().map(String::as_str));

    let status = Command::new(args.first().context("empty runner")?)
        .args(args.iter().skip(1))
        .status()
        .context("failed to run the command")?;
    if !status.success() {
        anyhow::bail!("Failed to run `{}`", args.join(" "));
    }
    Ok(())
}
