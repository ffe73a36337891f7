//! # pmtu-debug
//!
//! Command line front end for debugging Path MTU Discovery:
//!
//! - `server` answers probe requests with echoes of the requested size.
//! - `client` probes a server with a request of one size, asking for a response of another.
//! - `needtofrag` sends a forged ICMP "fragmentation needed" message to a host.
//!
//! Logging goes through `env_logger` at `info` unless `RUST_LOG` says otherwise.

mod needtofrag;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use pmtu_socket::{Client, ClientConfig, Outcome, Server, ServerConfig, Session};

use crate::needtofrag::NeedToFrag;

#[derive(Parser, Debug)]
#[command(version, about, arg_required_else_help = true)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for incoming requests
    Server {
        /// UDP port to serve on
        #[arg(long, default_value_t = 1337)]
        port: u16,

        /// How long to wait for a request before polling again, like 1m or 30s
        #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Send a request and wait for the echo
    Client {
        /// Server IPv4 address
        #[arg(long)]
        host: Ipv4Addr,

        /// Server UDP port
        #[arg(long, default_value_t = 1337)]
        port: u16,

        /// Size of the request payload
        #[arg(long, default_value_t = 1500)]
        request_size: usize,

        /// Size of the response payload asked from the server
        #[arg(long, default_value_t = 1500)]
        response_size: u16,

        /// Number of requests to send before giving up
        #[arg(long, default_value_t = 10)]
        attempts: usize,

        /// How long to wait for each response, like 1s or 500ms
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Pause between attempts
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        backoff: Duration,
    },

    /// Send an ICMP "fragmentation needed" packet
    #[command(name = "needtofrag")]
    NeedToFrag {
        /// Source address to put in the packet
        #[arg(long)]
        src_host: Ipv4Addr,

        /// Host to send the packet to
        #[arg(long)]
        dst_host: Ipv4Addr,

        /// Next-hop MTU announced in the packet
        #[arg(long, default_value_t = 1420)]
        mtu: u16,

        /// TTL of the packet
        #[arg(long, default_value_t = 64)]
        ttl: u8,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    if pmtu_socket::net_raw_capability() == Some(false) {
        log::warn!("CAP_NET_RAW is not in the effective capability set; raw sockets may fail");
    }

    match args.command {
        Command::Server { port, timeout } => {
            let config = ServerConfig {
                recv_timeout: timeout,
            };
            run_server(port, config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Client {
            host,
            port,
            request_size,
            response_size,
            attempts,
            timeout,
            backoff,
        } => {
            let config = ClientConfig {
                request_size,
                response_size,
                attempts,
                recv_timeout: timeout,
                backoff,
            };
            run_client(SocketAddrV4::new(host, port), config).await
        }
        Command::NeedToFrag {
            src_host,
            dst_host,
            mtu,
            ttl,
        } => {
            NeedToFrag {
                src: src_host,
                dst: dst_host,
                mtu,
                ttl,
            }
            .send()
            .context("failed to send ICMP packet")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_server(port: u16, config: ServerConfig) -> anyhow::Result<()> {
    let mut session = Session::bind(port).context("failed to create server session")?;
    log::info!("listening on {}", session.local_addr());

    let server = Server::new(config);
    tokio::select! {
        result = server.run(&mut session) => {
            result.context("server session stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            log::info!("interrupted, shutting down");
        }
    }

    session.close().await.context("failed to close server session")?;
    Ok(())
}

/// Probes `server`. Running out of attempts is reported with a failing exit code;
/// only a broken setup or transport is an error.
async fn run_client(server: SocketAddrV4, config: ClientConfig) -> anyhow::Result<ExitCode> {
    let client = Client::new(config).context("invalid client settings")?;
    let mut session = Session::connect(server).context("failed to create client session")?;
    log::info!(
        "probing {server} from {}: {} byte requests, {} byte responses",
        session.local_addr(),
        client.config().request_size,
        client.config().response_size
    );

    let outcome = client.run(&mut session).await;
    session.close().await.context("failed to close client session")?;
    report(server, outcome)
}

fn report(server: SocketAddrV4, outcome: Outcome) -> anyhow::Result<ExitCode> {
    match outcome {
        Outcome::Success { attempts } => {
            log::info!("SUCCESS: valid response after {attempts} attempt(s)");
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Exhausted { attempts } => {
            log::error!("FAIL: no valid response from {server} after {attempts} attempts");
            Ok(ExitCode::FAILURE)
        }
        Outcome::Failed { attempts, error } => {
            bail!("client session failed during attempt {attempts}: {error}")
        }
    }
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::*;
    use pmtu_socket::RecvError;

    const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), 1337);

    #[test]
    fn test_report_exit_codes() {
        let code = report(SERVER, Outcome::Success { attempts: 3 }).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        // exhaustion fails the process without an error
        let code = report(SERVER, Outcome::Exhausted { attempts: 10 }).unwrap();
        assert_eq!(code, ExitCode::FAILURE);

        let err = report(
            SERVER,
            Outcome::Failed {
                attempts: 2,
                error: RecvError::ReaderFailed,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("attempt 2"));
    }

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["pmtu-debug", "client", "--host", "192.0.2.7"]).unwrap();
        let Command::Client {
            host,
            port,
            request_size,
            response_size,
            attempts,
            timeout,
            backoff,
        } = args.command
        else {
            panic!("expected the client command");
        };
        assert_eq!(host, *SERVER.ip());
        assert_eq!(port, 1337);
        assert_eq!((request_size, response_size, attempts), (1500, 1500, 10));
        assert_eq!(timeout, Duration::from_secs(1));
        assert_eq!(backoff, Duration::from_secs(1));
    }
}
