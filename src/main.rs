use std::path::PathBuf;

use anyhow::Context as _;
use aya::{
    maps::AsyncPerfEventArray,
    programs::{KProbe, TracePoint},
    util::online_cpus,
    EbpfLoader,
};
use aya_log::EbpfLogger;
use bytes::BytesMut;
use clap::Parser;
use log::{debug, info, warn};
use tokio::signal;

use kretsnoop::{
    config::{kallsyms_has, ProbeSpec},
    decode::{payload_preview, RetprobeEvent},
};
use kretsnoop_common::{CaptureConfig, MAX_RECORD_SIZE};

#[derive(Debug, Parser)]
#[clap(about = "Trace kernel function returns together with their buffer arguments")]
struct Options {
    /// Kernel function to trace.
    #[clap(short, long)]
    function: String,

    /// Identifier stamped on every record of this probe.
    #[clap(long, default_value_t = 1)]
    probe_id: u32,

    /// Return value type: int, u32, s64, u64, size_t, ssize_t.
    #[clap(short, long)]
    return_type: Option<String>,

    /// Buffered argument to copy: none, char_buf, char_iovec.
    #[clap(short, long, default_value = "none")]
    capture: String,

    /// Entry argument index of the buffer (or iovec array) pointer.
    #[clap(long)]
    buffer_arg: Option<u32>,

    /// Entry argument index of the iovec segment count.
    #[clap(long)]
    count_arg: Option<u32>,

    /// Captured bytes shown per event.
    #[clap(long, default_value_t = 64)]
    preview: usize,

    /// Compiled eBPF object, see `cargo xtask build-ebpf`.
    #[clap(long, default_value = "target/bpfel-unknown-none/release/kretsnoop")]
    object: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long)]
    verbose: bool,
}

fn bump_memlock_rlimit() {
    // Needed for older kernels that don't use memcg based accounting, see
    // https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

fn print_event(function: &str, capture: &CaptureConfig, event: &RetprobeEvent, preview: usize) {
    let (ret, payload) = event.split_args(capture.return_type);
    let pid = event
        .current
        .map(|current| current.pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    let ret = ret.map(|ret| ret.to_string()).unwrap_or_default();

    println!(
        "{:<16} {:<7} {:<24} {:<5} {:>12} {}",
        event.ktime,
        pid,
        function,
        event.size,
        ret,
        payload_preview(&payload, preview),
    );
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opts = Options::parse();
    let level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = ProbeSpec {
        function: opts.function.clone(),
        probe_id: opts.probe_id,
        return_type: opts.return_type.clone(),
        capture: opts.capture.clone(),
        buffer_arg: opts.buffer_arg,
        count_arg: opts.count_arg,
    }
    .resolve()?;
    let capture = config.capture();
    debug!("resolved probe config: {config:?}");

    match std::fs::read_to_string("/proc/kallsyms") {
        Ok(kallsyms) if !kallsyms_has(&kallsyms, &opts.function) => {
            warn!("{} not found in /proc/kallsyms", opts.function)
        }
        Ok(_) => {}
        Err(e) => debug!("cannot read /proc/kallsyms: {e}"),
    }

    bump_memlock_rlimit();

    let mut bpf = EbpfLoader::new()
        .set_global("PROBE_CONFIG", &config, true)
        .load_file(&opts.object)
        .with_context(|| format!("failed to load {}", opts.object.display()))?;

    if let Err(e) = EbpfLogger::init(&mut bpf) {
        // This can happen if you remove all log statements from your eBPF program.
        warn!("failed to initialize eBPF logger: {e}");
    }

    for name in ["generic_kprobe", "generic_retkprobe"] {
        let program: &mut KProbe = bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()?;
        program.load()?;
        program
            .attach(&opts.function, 0)
            .with_context(|| format!("failed to attach {name} to {}", opts.function))?;
    }

    for name in ["sched_process_exec", "sched_process_fork"] {
        let program: &mut TracePoint = bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()?;
        program.load()?;
        program.attach("sched", name)?;
    }

    let mut events =
        AsyncPerfEventArray::try_from(bpf.take_map("EVENTS").context("map EVENTS not found")?)?;

    println!(
        "{:<16} {:<7} {:<24} {:<5} {:>12} {}",
        "KTIME", "PID", "FUNCTION", "SIZE", "RET", "ARGS"
    );

    let cpus = online_cpus().map_err(|(_, error)| error)?;
    for cpu_id in cpus {
        let mut buf = events.open(cpu_id, None)?;
        let function = opts.function.clone();
        let preview = opts.preview;

        tokio::spawn(async move {
            let mut buffers = (0..10)
                .map(|_| BytesMut::with_capacity(MAX_RECORD_SIZE + 64))
                .collect::<Vec<_>>();

            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("cpu {cpu_id}: reading perf buffer failed: {e}");
                        return;
                    }
                };
                if events.lost > 0 {
                    warn!("cpu {cpu_id}: lost {} events", events.lost);
                }
                for raw in buffers.iter().take(events.read) {
                    match RetprobeEvent::parse(raw) {
                        Ok(event) => print_event(&function, &capture, &event, preview),
                        Err(e) => debug!("cpu {cpu_id}: dropping record: {e:#}"),
                    }
                }
            }
        });
    }

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");
    Ok(())
}
