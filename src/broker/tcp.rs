//! beanstalkd text protocol over TCP.
//!
//! Each command is one CRLF-terminated line. Replies are a status line,
//! optionally followed by a `<bytes>` sized body and a trailing CRLF
//! (`RESERVED <id> <bytes>` and `OK <bytes>`). Dictionary bodies such as
//! `stats-job` are YAML.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{Broker, Connection, Reserved};
use crate::error::BrokerError;

/// Default beanstalkd port.
pub const DEFAULT_PORT: u16 = 11300;

/// Statuses the server uses to report a failed command regardless of which
/// command was sent.
const SERVER_ERRORS: &[&str] = &[
    "OUT_OF_MEMORY",
    "INTERNAL_ERROR",
    "BAD_FORMAT",
    "UNKNOWN_COMMAND",
    "DRAINING",
    "EXPECTED_CRLF",
    "JOB_TOO_BIG",
];

/// Upper bound on a reply body. beanstalkd caps job size (`-z`) at 1 GiB.
const MAX_BODY_LEN: usize = 1 << 30;

/// Dials beanstalkd over TCP.
#[derive(Debug, Clone)]
pub struct TcpBroker {
    addr: String,
}

impl TcpBroker {
    /// `addr` is a `host:port` pair.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    fn address(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let conn = TcpConnection::connect(&self.addr).await?;
        Ok(Arc::new(conn))
    }
}

/// A parsed reply: the status word, its arguments, and the body if the
/// status carries one.
#[derive(Debug)]
struct Reply {
    status: String,
    args: Vec<String>,
    line: String,
    body: Option<Vec<u8>>,
}

impl Reply {
    fn arg<T: std::str::FromStr>(&self, index: usize, command: &str) -> Result<T, BrokerError> {
        self.args
            .get(index)
            .and_then(|arg| arg.parse().ok())
            .ok_or_else(|| unexpected(command, &self.line))
    }
}

fn unexpected(command: &str, reply: &str) -> BrokerError {
    BrokerError::UnexpectedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    }
}

/// One beanstalkd session. Commands are serialized through an async mutex,
/// so the connection can be shared between a reservation loop and the job it
/// is handling.
pub struct TcpConnection {
    io: Mutex<BufStream<TcpStream>>,
}

impl TcpConnection {
    /// Opens a session to `addr` with Nagle disabled.
    pub async fn connect(addr: &str) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BrokerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        Ok(Self {
            io: Mutex::new(BufStream::new(stream)),
        })
    }

    /// Sends one command line and reads its reply, including any body.
    async fn send(&self, command: &str) -> Result<Reply, BrokerError> {
        let mut io = self.io.lock().await;

        io.write_all(command.as_bytes()).await?;
        io.write_all(b"\r\n").await?;
        io.flush().await?;

        let mut line = String::new();
        if io.read_line(&mut line).await? == 0 {
            return Err(BrokerError::Closed);
        }
        let line = line.trim_end().to_string();

        let mut words = line.split_whitespace().map(str::to_string);
        let status = words.next().ok_or_else(|| unexpected(command, &line))?;
        let args: Vec<String> = words.collect();

        if SERVER_ERRORS.contains(&status.as_str()) {
            return Err(BrokerError::Server(line));
        }

        let body_len = match status.as_str() {
            "RESERVED" => Some(args.get(1)),
            "OK" => Some(args.first()),
            _ => None,
        };

        let body = match body_len {
            Some(len) => {
                let len: usize = len
                    .and_then(|len| len.parse().ok())
                    .filter(|&len| len <= MAX_BODY_LEN)
                    .ok_or_else(|| unexpected(command, &line))?;
                let framed = len
                    .checked_add(2)
                    .ok_or_else(|| unexpected(command, &line))?;
                let mut body = vec![0u8; framed];
                io.read_exact(&mut body).await?;
                if !body.ends_with(b"\r\n") {
                    return Err(unexpected(command, &line));
                }
                body.truncate(len);
                Some(body)
            }
            None => None,
        };

        Ok(Reply {
            status,
            args,
            line,
            body,
        })
    }

    /// Sends `command` and accepts only `expected` as the reply status.
    async fn expect(&self, command: &str, expected: &str) -> Result<Reply, BrokerError> {
        let reply = self.send(command).await?;
        if reply.status == expected {
            Ok(reply)
        } else {
            Err(unexpected(command, &reply.line))
        }
    }

    async fn dict(&self, command: &str) -> Result<HashMap<String, String>, BrokerError> {
        let reply = self.send(command).await?;
        match (reply.status.as_str(), reply.body) {
            ("OK", Some(body)) => Ok(serde_yaml::from_slice(&body)?),
            _ => Err(unexpected(command, &reply.line)),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn watch(&self, tubes: &[String]) -> Result<(), BrokerError> {
        for tube in tubes {
            self.expect(&format!("watch {tube}"), "WATCHING").await?;
        }

        if !tubes.iter().any(|tube| tube == "default") {
            let command = "ignore default";
            let reply = self.send(command).await?;
            if reply.status != "WATCHING" && reply.status != "NOT_IGNORED" {
                return Err(unexpected(command, &reply.line));
            }
        }
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Reserved, BrokerError> {
        let command = format!("reserve-with-timeout {}", timeout.as_secs());
        let reply = self.send(&command).await?;
        match reply.status.as_str() {
            "RESERVED" => {
                let id = reply.arg(0, &command)?;
                let body = reply.body.unwrap_or_default();
                Ok(Reserved { id, body })
            }
            "TIMED_OUT" => Err(BrokerError::TimedOut),
            "DEADLINE_SOON" => Err(BrokerError::DeadlineSoon),
            _ => Err(unexpected(&command, &reply.line)),
        }
    }

    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>, BrokerError> {
        let command = format!("stats-job {id}");
        match self.dict(&command).await {
            Err(BrokerError::UnexpectedReply { reply, .. }) if reply == "NOT_FOUND" => {
                Err(BrokerError::NotFound(id))
            }
            other => other,
        }
    }

    async fn stats(&self) -> Result<HashMap<String, String>, BrokerError> {
        self.dict("stats").await
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        let command = format!("delete {id}");
        let reply = self.send(&command).await?;
        match reply.status.as_str() {
            "DELETED" => Ok(()),
            "NOT_FOUND" => Err(BrokerError::NotFound(id)),
            _ => Err(unexpected(&command, &reply.line)),
        }
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        let command = format!("release {id} {priority} {}", delay.as_secs());
        let reply = self.send(&command).await?;
        match reply.status.as_str() {
            "RELEASED" => Ok(()),
            "BURIED" => Err(BrokerError::Buried(id)),
            "NOT_FOUND" => Err(BrokerError::NotFound(id)),
            _ => Err(unexpected(&command, &reply.line)),
        }
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError> {
        let command = format!("bury {id} {priority}");
        let reply = self.send(&command).await?;
        match reply.status.as_str() {
            "BURIED" => Ok(()),
            "NOT_FOUND" => Err(BrokerError::NotFound(id)),
            _ => Err(unexpected(&command, &reply.line)),
        }
    }

    async fn touch(&self, id: u64) -> Result<(), BrokerError> {
        let command = format!("touch {id}");
        let reply = self.send(&command).await?;
        match reply.status.as_str() {
            "TOUCHED" => Ok(()),
            "NOT_FOUND" => Err(BrokerError::NotFound(id)),
            _ => Err(unexpected(&command, &reply.line)),
        }
    }
}
