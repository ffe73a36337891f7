//! # Probe Client
//!
//! ## Purpose
//!
//! Sends one probe request of a chosen size to a server and waits for an echo of a
//! chosen size, retrying a bounded number of times. Whether the echo ever arrives,
//! and which ICMP messages show up meanwhile, is what tells the operator where along
//! the path large packets get lost.
//!
//! ## How it works
//!
//! The request starts with the desired response size (big-endian u16) followed by
//! random filler. The client runs an explicit state machine:
//!
//! `Idle -> Sending -> AwaitingResponse -> {Success, Retrying -> Sending, Exhausted}`
//!
//! While awaiting a response it keeps calling `receive` with the per-call timeout:
//! ICMP messages are logged and waiting continues, a timeout or bad echo ends the
//! attempt. A closed or broken transport ends the whole run in `Failed`.
//! An echo is valid if it has the requested length and byte `i` equals request byte
//! `i % request.len()`.
//!
//! ## Main components
//!
//! - `ClientConfig`: sizes, attempt count and timings.
//! - `Client::run()`: drives the state machine over any `Transport`.
//! - `build_request()`, `check_echo()`: payload framing and validation.

use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;

use crate::demux::Event;
use crate::header::MAX_UDP_PAYLOAD;
use crate::icmp::log_icmp_message;
use crate::session::{RecvError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Size of the request datagram payload, at least 2.
    pub request_size: usize,
    /// Size of the echo asked from the server.
    pub response_size: u16,
    pub attempts: usize,
    /// Timeout of each individual `receive` call.
    pub recv_timeout: Duration,
    /// Pause before every attempt but the first.
    pub backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_size: 1500,
            response_size: 1500,
            attempts: 10,
            recv_timeout: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("request size must be at least 2 bytes, got {0}")]
    RequestTooSmall(usize),
    #[error("request size {size} exceeds the largest UDP payload ({max} bytes)")]
    RequestTooLarge { size: usize, max: usize },
    #[error("response must be at least 1 byte")]
    ResponseTooSmall,
    #[error("at least one attempt is required")]
    NoAttempts,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_size < 2 {
            return Err(ConfigError::RequestTooSmall(self.request_size));
        }
        if self.request_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::RequestTooLarge {
                size: self.request_size,
                max: MAX_UDP_PAYLOAD,
            });
        }
        if self.response_size < 1 {
            return Err(ConfigError::ResponseTooSmall);
        }
        if self.attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }
}

/// How a probe ended. Running out of attempts is a result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success { attempts: usize },
    Exhausted { attempts: usize },
    /// The transport stopped delivering during attempt `attempts`.
    Failed { attempts: usize, error: RecvError },
}

/// Result of waiting for one echo.
enum Wait {
    Echo,
    Retry,
    Fatal(RecvError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    #[error("expected size {expected} but got {got}")]
    Length { expected: usize, got: usize },
    #[error("invalid byte at offset {offset}")]
    Content { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Sending { attempt: usize },
    AwaitingResponse { attempt: usize },
    Retrying { attempt: usize },
    Success { attempt: usize },
    Exhausted { attempts: usize },
    Failed { attempt: usize, error: RecvError },
}

/// Builds a request of `request_size` bytes asking for `response_size` bytes back.
pub fn build_request(request_size: usize, response_size: u16) -> Vec<u8> {
    let mut request = vec![0u8; request_size.max(2)];
    request[..2].copy_from_slice(&response_size.to_be_bytes());
    rand::thread_rng().fill(&mut request[2..]);
    request
}

/// Checks that `response` is `request` repeated cyclically to `expected_len` bytes.
pub fn check_echo(request: &[u8], response: &[u8], expected_len: usize) -> Result<(), Mismatch> {
    if response.len() != expected_len {
        return Err(Mismatch::Length {
            expected: expected_len,
            got: response.len(),
        });
    }
    match response
        .iter()
        .zip(request.iter().cycle())
        .position(|(got, want)| got != want)
    {
        Some(offset) => Err(Mismatch::Content { offset }),
        None => Ok(()),
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs the probe over `transport` until an echo validates or attempts run out.
    pub async fn run<T: Transport>(&self, transport: &mut T) -> Outcome {
        let request = build_request(self.config.request_size, self.config.response_size);
        let mut state = ClientState::Idle;
        loop {
            log::trace!("client state: {state:?}");
            state = match state {
                ClientState::Idle => ClientState::Sending { attempt: 1 },
                ClientState::Sending { attempt } => {
                    log::info!(
                        "sending request of {} bytes (attempt {attempt}/{}) ...",
                        request.len(),
                        self.config.attempts
                    );
                    match transport.send(&request, None).await {
                        Ok(()) => ClientState::AwaitingResponse { attempt },
                        Err(e) => {
                            log::warn!("failed to send request: {e}");
                            ClientState::Retrying { attempt }
                        }
                    }
                }
                ClientState::AwaitingResponse { attempt } => {
                    match self.await_echo(transport, &request).await {
                        Wait::Echo => ClientState::Success { attempt },
                        Wait::Retry => ClientState::Retrying { attempt },
                        Wait::Fatal(error) => ClientState::Failed { attempt, error },
                    }
                }
                ClientState::Retrying { attempt } if attempt >= self.config.attempts => {
                    ClientState::Exhausted { attempts: attempt }
                }
                ClientState::Retrying { attempt } => {
                    tokio::time::sleep(self.config.backoff).await;
                    ClientState::Sending {
                        attempt: attempt + 1,
                    }
                }
                ClientState::Success { attempt } => {
                    return Outcome::Success { attempts: attempt };
                }
                ClientState::Exhausted { attempts } => return Outcome::Exhausted { attempts },
                ClientState::Failed { attempt, error } => {
                    return Outcome::Failed {
                        attempts: attempt,
                        error,
                    };
                }
            };
        }
    }

    /// Waits for the echo of `request`, skipping over ICMP messages.
    async fn await_echo<T: Transport>(&self, transport: &mut T, request: &[u8]) -> Wait {
        let expected = usize::from(self.config.response_size);
        loop {
            match transport.receive(self.config.recv_timeout).await {
                Ok(Event::Icmp(icmp)) => {
                    log_icmp_message(icmp.source, &icmp.payload);
                }
                Ok(Event::Udp(udp)) => {
                    return match check_echo(request, &udp.payload, expected) {
                        Ok(()) => Wait::Echo,
                        Err(e) => {
                            log::warn!("{}: {e}; retrying...", udp.source);
                            Wait::Retry
                        }
                    };
                }
                Err(RecvError::Timeout) => {
                    log::warn!("timeout waiting for response; retrying...");
                    return Wait::Retry;
                }
                Err(e) => {
                    log::error!("giving up while waiting for response: {e}");
                    return Wait::Fatal(e);
                }
            }
        }
    }
}
