mod build_ebpf;
mod run;

use clap::Parser;

/// Build helpers for kretsnoop.
#[derive(Debug, Parser)]
struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Compile the eBPF object with the nightly toolchain.
    BuildEbpf(build_ebpf::Options),
    /// Build everything and run kretsnoop against the fresh object.
    Run(run::Options),
}

fn main() -> anyhow::Result<()> {
    match Options::parse().command {
        Command::BuildEbpf(opts) => build_ebpf::build_ebpf(opts),
        Command::Run(opts) => run::run(opts),
    }
}
