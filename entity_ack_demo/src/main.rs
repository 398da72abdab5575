//! Entity invocation loopback demo executable.
//!
//! Issues a batch of invocations against an in-process server that stops
//! answering after a while, fails over to a second in-process server, and
//! shows every blocked caller being released by the second server.

use std::process::ExitCode;
use std::thread::{self, JoinHandle};

use bytes::Bytes;

use clap::Parser;

use rand::Rng;

use tokio::sync::mpsc;

use entity_ack::{
    logger_init, pf_error, pf_info, pf_warn, AckFrame, AckRequirements,
    ClientConnection, EntityError, FrameSender, FrameSink, InvokeError,
    InvokeFuture, InvokeId, StateTree,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Connection configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of invocations to issue.
    #[arg(short, long, default_value_t = 8)]
    invocations: usize,

    /// Number of invocations the first server answers before it goes
    /// silent and the connection fails over.
    #[arg(short, long, default_value_t = 3)]
    failover_after: usize,

    /// Probability that the second server fails an invocation.
    #[arg(short, long, default_value_t = 0.0)]
    error_rate: f64,

    /// Print the connection state dump as JSON at the end.
    #[arg(short, long)]
    dump: bool,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(EntityError)` on any error.
    fn sanitize(&self) -> Result<(), EntityError> {
        if self.invocations == 0 {
            Err(EntityError::msg(format!(
                "invalid number of invocations {}",
                self.invocations
            )))
        } else if self.failover_after > self.invocations {
            Err(EntityError::msg(format!(
                "failover_after {} > invocations {}",
                self.failover_after, self.invocations
            )))
        } else if !(0.0..=1.0).contains(&self.error_rate) {
            Err(EntityError::msg(format!(
                "invalid error_rate {}",
                self.error_rate
            )))
        } else {
            Ok(())
        }
    }
}

/// Sink delivering raw messages to an in-process server thread.
struct LoopbackSink {
    tx: mpsc::UnboundedSender<(InvokeId, Bytes)>,
}

impl FrameSink for LoopbackSink {
    fn transmit(
        &mut self,
        id: InvokeId,
        payload: Bytes,
    ) -> Result<(), EntityError> {
        self.tx
            .send((id, payload))
            .map_err(|_| EntityError::msg("loopback server gone"))
    }
}

/// In-process server thread. Acknowledges and completes the first
/// `answer_limit` messages (all of them if `None`), then stays silent.
/// Completion result is the reversed payload.
fn server_thread(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<(InvokeId, Bytes)>,
    frames: FrameSender,
    answer_limit: Option<usize>,
    error_rate: f64,
) -> Result<(), EntityError> {
    let mut rng = rand::thread_rng();
    let mut answered = 0;

    while let Some((id, payload)) = rx.blocking_recv() {
        if answer_limit.is_some_and(|limit| answered >= limit) {
            pf_warn!(name; "dropping invocation {}", id);
            continue;
        }
        frames.send(AckFrame::Received { id })?;

        let result = if rng.gen_bool(error_rate) {
            Err(EntityError::msg(format!("{} rejected {}", name, id)))
        } else {
            let mut reply = payload.to_vec();
            reply.reverse();
            Ok(Bytes::from(reply))
        };
        frames.send(AckFrame::Complete { id, result })?;
        answered += 1;
    }

    Ok(())
}

/// Spawns an in-process server, returning a sink connected to it.
fn spawn_server(
    name: &'static str,
    frames: FrameSender,
    answer_limit: Option<usize>,
    error_rate: f64,
) -> (Box<dyn FrameSink>, JoinHandle<Result<(), EntityError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = thread::spawn(move || {
        server_thread(name, rx, frames, answer_limit, error_rate)
    });
    (Box::new(LoopbackSink { tx }), handle)
}

/// Actual main function of the demo executable.
fn demo_main() -> Result<(), EntityError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };

    // server A's channel comes first: the connection needs its sink, and the
    // server thread needs the connection's frame sender
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let conn = ClientConnection::new_and_setup(
        Box::new(LoopbackSink { tx: tx_a }),
        config_str,
    )?;
    let frames = conn.frame_sender();
    let frames_a = frames.clone();
    let limit = args.failover_after;
    let server_a = thread::spawn(move || {
        server_thread("server-a", rx_a, frames_a, Some(limit), 0.0)
    });

    // issue all invocations, one blocked caller thread each
    let mut callers = Vec::with_capacity(args.invocations);
    for i in 0..args.invocations {
        let payload = Bytes::from(format!("op-{}", i));
        let wait = conn.invoke(payload, AckRequirements::all())?;
        callers.push((wait.id(), thread::spawn(move || wait.get())));
    }

    // wait for server A to answer what it will answer, then fail over
    let mut results: Vec<(InvokeId, Result<Bytes, InvokeError>)> = vec![];
    let mut pending = callers.into_iter();
    for (id, caller) in pending.by_ref().take(args.failover_after) {
        results.push((id, join_caller(caller)?));
    }
    let (sink_b, server_b) =
        spawn_server("server-b", frames, None, args.error_rate);
    let resent = conn.failover(sink_b)?;
    pf_info!(conn.name(); "failed over, {} invocations resent", resent);

    for (id, caller) in pending {
        results.push((id, join_caller(caller)?));
    }
    for (id, result) in &results {
        match result {
            Ok(reply) => pf_info!(
                conn.name();
                "invocation {} -> {}",
                id,
                String::from_utf8_lossy(reply)
            ),
            Err(e) => pf_warn!(conn.name(); "invocation {} -> {}", id, e),
        }
    }

    if args.dump {
        let tree = StateTree::new();
        conn.add_state_to(&tree.sub_tree("connection")?)?;
        println!("{}", serde_json::to_string_pretty(&tree.to_json())?);
    }

    conn.shutdown()?;
    drop(conn);
    join_server(server_a)?;
    join_server(server_b)?;
    Ok(())
}

fn join_caller(
    caller: JoinHandle<Result<Bytes, InvokeError>>,
) -> Result<Result<Bytes, InvokeError>, EntityError> {
    caller
        .join()
        .map_err(|_| EntityError::msg("caller thread panicked"))
}

fn join_server(
    server: JoinHandle<Result<(), EntityError>>,
) -> Result<(), EntityError> {
    server
        .join()
        .map_err(|_| EntityError::msg("server thread panicked"))?
}

/// Main function of the demo executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = demo_main() {
        pf_error!("demo"; "demo_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("demo"; "demo_main exitted successfully");
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args(invocations: usize, failover_after: usize, rate: f64) -> CliArgs {
        CliArgs {
            config: "".into(),
            invocations,
            failover_after,
            error_rate: rate,
            dump: false,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert!(args(8, 3, 0.0).sanitize().is_ok());
        assert!(args(8, 8, 1.0).sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid_invocations() {
        assert!(args(0, 0, 0.0).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_failover_after() {
        assert!(args(2, 3, 0.0).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_error_rate() {
        assert!(args(8, 3, 1.5).sanitize().is_err());
        assert!(args(8, 3, -0.1).sanitize().is_err());
    }
}
