use clap::Parser;
use farcall::{MockConnector, Prx, Runtime, RuntimeConfig};
use farcall_demo::{Job, Printer, PrinterPrx, ScriptedPrinter};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Twoway,
    Oneway,
    Batch,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Stringified proxy of the printer.
    #[arg(default_value = "printer:tcp -h 127.0.0.1 -p 10000")]
    pub proxy: String,

    /// Invocation mode.
    #[arg(long, value_enum, default_value = "twoway")]
    pub mode: Mode,

    /// Text to print.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Number of copies.
    #[arg(short, long, default_value_t = 1)]
    pub copies: u32,

    /// Use MessagePack
    #[arg(long, default_value_t = false)]
    pub use_msgpack: bool,

    /// Let the printer drop its connection on every n-th request.
    #[arg(long, default_value_t = 0)]
    pub drop_every: usize,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "10")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, printer: PrinterPrx) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let secs = args.secs;
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let job = Job {
            text: args.value.clone(),
            copies: args.copies,
        };
        let state = state.clone();
        let printer = printer.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = printer.print(&job).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("stress task failed: {e}");
                }
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[tokio::main]
async fn main() -> farcall::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let scripted = Arc::new(ScriptedPrinter::new(args.drop_every));
    let connector = MockConnector::new(move |req| scripted.respond(req));
    let config = RuntimeConfig {
        use_msgpack: args.use_msgpack,
        ..Default::default()
    };
    let runtime = Runtime::create(config, Arc::new(connector.clone()))?;

    let object = runtime.string_to_proxy(&args.proxy)?;
    let Some(printer) = object.checked_cast::<PrinterPrx>().await? else {
        tracing::error!("{object} is not a printer");
        return Ok(());
    };

    if args.stress {
        stress_test(args, printer).await;
    } else {
        let job = Job {
            text: args.value.clone(),
            copies: args.copies,
        };
        match args.mode {
            Mode::Twoway => {
                let rsp = printer.print(&job).await;
                tracing::info!("print rsp: {:?}", rsp);
                let rsp = printer.queue_len().await;
                tracing::info!("queue_len rsp: {:?}", rsp);
            }
            Mode::Oneway => {
                let rsp = printer.as_oneway().print(&job).await;
                tracing::info!("oneway print rsp: {:?}", rsp);
            }
            Mode::Batch => {
                let batch = printer.as_batch_oneway();
                for _ in 0..3 {
                    batch.print(&job).await?;
                }
                tracing::info!("queued {} batch request(s)", batch.batch_request_count());
                let rsp = batch.flush_batch_requests().await;
                tracing::info!("flush rsp: {:?}", rsp);
            }
        }
    }

    tracing::info!(
        "{} connect(s), {} frame(s) sent",
        connector.connects(),
        connector.sends()
    );
    runtime.destroy().await;
    Ok(())
}
