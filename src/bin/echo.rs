//! In-process echo benchmark.
//!
//! Starts an echo server and a set of client threads in one process and
//! drives unary calls between them through completion queues. The server
//! polls a shared queue from `server.pollers` threads; each client thread
//! owns its own queue and plucks its batch completions.

use bytes::Bytes;
use clap::Parser;
use rpc_core::config::{Config, parse_size};
use rpc_core::{
    Channel, CompletionQueue, CompletionType, Metadata, Operation, OperationType,
    PayloadHandling, RegisteredMethod, Server, StatusCode, Tag, Timespec, logging,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "rpc-echo")]
#[command(about = "In-process echo benchmark for the RPC call engine")]
struct Args {
    /// Path to configuration file (optional, CLI args override config)
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Total number of calls
    #[arg(short = 'n', long)]
    requests: Option<usize>,

    /// Calls in flight at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Request payload size (e.g. 64B, 1KB)
    #[arg(short, long, value_parser = parse_size)]
    payload_size: Option<usize>,
}

/// What a server-side event tag stands for.
enum Step {
    Request,
    Reply,
    Shutdown,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(requests) = args.requests {
        config.client.requests = requests;
    }
    if let Some(concurrency) = args.concurrency {
        config.client.concurrency = concurrency;
    }
    if let Some(payload_size) = args.payload_size {
        config.client.payload_size = payload_size;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "echo failed");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server_cq = Arc::new(CompletionQueue::new());
    let server = Arc::new(Server::new(config.server.args.clone()));
    server.register_completion_queue(&server_cq)?;
    let method = server.register_method(
        &config.client.method,
        None,
        PayloadHandling::ReadInitialByteBuffer,
    )?;
    let port = server.add_port(&config.server.address)?;
    server.start()?;

    for _ in 0..config.client.concurrency {
        server.request_registered_call(
            method,
            &server_cq,
            &server_cq,
            Tag::with_payload(Step::Request),
            true,
        )?;
    }

    let served = Arc::new(AtomicUsize::new(0));
    let mut pollers = Vec::with_capacity(config.server.pollers);
    for id in 0..config.server.pollers {
        let server = server.clone();
        let cq = server_cq.clone();
        let served = served.clone();
        let handle = std::thread::Builder::new()
            .name(format!("echo-server-{}", id))
            .spawn(move || serve(&server, method, &cq, &served))
            .expect("failed to spawn server poller");
        pollers.push(handle);
    }

    let target = config
        .client
        .target
        .clone()
        .unwrap_or_else(|| format!("localhost:{}", port));
    info!(%target, port, "echo server listening");

    let channel = Channel::new(&target, config.client.args.clone())?;
    let payload = Bytes::from(vec![0x5a; config.client.payload_size]);
    let deadline = Duration::from_millis(config.client.deadline_ms);
    let remaining = Arc::new(AtomicUsize::new(config.client.requests));
    let ok = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut clients = Vec::with_capacity(config.client.concurrency);
    for id in 0..config.client.concurrency {
        let channel = channel.clone();
        let method = config.client.method.clone();
        let payload = payload.clone();
        let remaining = remaining.clone();
        let ok = ok.clone();
        let handle = std::thread::Builder::new()
            .name(format!("echo-client-{}", id))
            .spawn(move || {
                let cq = CompletionQueue::new();
                while remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok()
                {
                    if unary(&channel, &cq, &method, &payload, deadline) {
                        ok.fetch_add(1, Ordering::Relaxed);
                    }
                }
                cq.shutdown();
                while cq.next().completion_type() != CompletionType::QueueShutdown {}
            })
            .expect("failed to spawn client");
        clients.push(handle);
    }
    for handle in clients {
        let _ = handle.join();
    }
    let elapsed = start.elapsed();

    server.shutdown(&server_cq, Tag::with_payload(Step::Shutdown))?;
    for handle in pollers {
        let _ = handle.join();
    }

    let completed = ok.load(Ordering::Relaxed);
    info!(
        requests = config.client.requests,
        ok = completed,
        failed = config.client.requests - completed,
        served = served.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis() as u64,
        rate = (config.client.requests as f64 / elapsed.as_secs_f64()) as u64,
        "echo finished"
    );
    Ok(())
}

/// Poll the server queue, echoing each request back to its caller.
fn serve(server: &Server, method: RegisteredMethod, cq: &CompletionQueue, served: &AtomicUsize) {
    loop {
        let mut event = cq.next();
        match event.completion_type() {
            CompletionType::QueueShutdown => break,
            CompletionType::Timeout => continue,
            CompletionType::OperationComplete => {}
        }

        let step = match event.tag().and_then(|t| t.payload::<Step>()) {
            Some(Step::Request) => Step::Request,
            Some(Step::Reply) => Step::Reply,
            Some(Step::Shutdown) => Step::Shutdown,
            None => continue,
        };

        match step {
            Step::Shutdown => {
                debug!("server shut down");
                cq.shutdown();
            }
            Step::Reply => {
                if event.success() {
                    served.fetch_add(1, Ordering::Relaxed);
                }
            }
            Step::Request => {
                // requests fail once the server is shutting down
                if !event.success() {
                    continue;
                }
                if let Err(e) = server.request_registered_call(
                    method,
                    cq,
                    cq,
                    Tag::with_payload(Step::Request),
                    true,
                ) {
                    debug!(error = %e, "failed to re-arm request");
                }

                let payload = event.request_payload().cloned().unwrap_or_default();
                let Some(call) = event.take_call() else {
                    continue;
                };
                let ops = [
                    Operation::send_initial_metadata(Metadata::new()),
                    Operation::send_message(payload),
                    Operation::send_status_from_server(Metadata::new(), StatusCode::Ok, ""),
                    Operation::receive_close_on_server(),
                ];
                if let Err(e) = call.start_batch(ops, Tag::with_payload(Step::Reply)) {
                    warn!(error = %e, call = ?call, "failed to reply");
                }
            }
        }
    }
}

/// Run one unary call to completion. Returns true on an OK echo.
fn unary(
    channel: &Channel,
    cq: &CompletionQueue,
    method: &str,
    payload: &Bytes,
    deadline: Duration,
) -> bool {
    let call = channel.create_call(cq, method, "", Timespec::after(deadline));
    let tag = Tag::new();
    let ops = [
        Operation::send_initial_metadata(Metadata::new()),
        Operation::send_message(payload.clone()),
        Operation::send_close_from_client(),
        Operation::receive_initial_metadata(),
        Operation::receive_message(),
        Operation::receive_status_on_client(),
    ];
    if let Err(e) = call.start_batch(ops, tag.clone()) {
        warn!(error = %e, "failed to start call");
        return false;
    }

    let event = cq.pluck(&tag, Timespec::inf_future());
    let mut echoed = false;
    let mut status = None;
    for result in event.batch_operations() {
        match result.operation_type() {
            OperationType::ReceiveMessage => {
                echoed = result.received_message() == Some(payload);
            }
            OperationType::ReceiveStatusOnClient => {
                status = result.received_status_code();
            }
            _ => {}
        }
    }
    if status != Some(StatusCode::Ok) {
        debug!(?status, "call failed");
    }
    event.success() && echoed && status == Some(StatusCode::Ok)
}

fn print_default_config() {
    print!(
        r#"# rpc-echo configuration

[logging]
level = "info"
format = "pretty"      # pretty, compact, json
timestamps = true
target = false
thread_names = false

[server]
address = "[::]:0"
pollers = 1

[server.args]
# "grpc.max_receive_message_length" = 4194304

[client]
# target = "localhost:50051"   # defaults to the bound server port
method = "/echo.Echo/Unary"
requests = 100
concurrency = 4
payload_size = "64B"
deadline_ms = 5000

[client.args]
# "grpc.max_send_message_length" = 4194304
# "grpc.default_authority" = "echo.local"
"#
    );
}
