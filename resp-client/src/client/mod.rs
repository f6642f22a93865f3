use crate::protocol::RespCodec;
use async_trait::async_trait;
use datastore::{Command, Connection, Reply};
use futures::{SinkExt, StreamExt};
use shared::config::Config;
use shared::{Error, Result};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// TCP connection to the remote cache speaking RESP.
///
/// Not safe for interleaved use: every exchange assumes the replies it reads
/// belong to the commands it just wrote. A timed-out or failed exchange can
/// leave stray replies on the socket, so the connection poisons itself and
/// refuses further work.
pub struct RespConnection {
    framed: Framed<TcpStream, RespCodec>,
    peer: String,
    io_timeout: Option<Duration>,
    poisoned: bool,
    closed: bool,
}

impl RespConnection {
    pub async fn connect<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let peer = addr.to_string();
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            warn!("Connection to {} failed: {}", peer, e);
            Error::transport(format!("failed to connect to {}", peer), e)
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on {}: {}", peer, e);
        }

        debug!("Connected to {}", peer);

        Ok(Self {
            framed: Framed::new(stream, RespCodec),
            peer,
            io_timeout: None,
            poisoned: false,
            closed: false,
        })
    }

    /// Connects to `config.address()`, then authenticates and selects the
    /// database when the config asks for it.
    pub async fn connect_with(config: &Config) -> Result<Self> {
        let address = config.address();
        let mut conn = match config.io_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::connect(address.as_str()))
                .await
                .map_err(|_| {
                    Error::transport(
                        format!("failed to connect to {}", address),
                        format!("no answer within {:?}", limit),
                    )
                })??,
            None => Self::connect(address.as_str()).await?,
        };
        conn.io_timeout = config.io_timeout;

        if let Some(password) = &config.password {
            conn.send(Command::auth(password))
                .await?
                .into_result("failed to authenticate")?;
        }
        if config.database != 0 {
            conn.send(Command::select(config.database))
                .await?
                .into_result("failed to select database")?;
        }

        Ok(conn)
    }

    pub fn with_io_timeout(mut self, limit: Duration) -> Self {
        self.io_timeout = Some(limit);
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    async fn exchange(&mut self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if self.closed {
            return Err(Error::transport("connection closed", &self.peer));
        }
        if self.poisoned {
            return Err(Error::transport(
                "connection poisoned",
                "an earlier exchange did not complete",
            ));
        }

        trace!("Sending {} command(s) to {}", commands.len(), self.peer);

        let result = match self.io_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, round_trip(&mut self.framed, commands)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::transport(
                        "request timed out",
                        format!("no reply within {:?}", limit),
                    )),
                }
            }
            None => round_trip(&mut self.framed, commands).await,
        };

        if let Err(e) = &result {
            warn!("Exchange with {} failed, poisoning connection: {}", self.peer, e);
            self.poisoned = true;
        }

        result
    }
}

async fn round_trip(
    framed: &mut Framed<TcpStream, RespCodec>,
    commands: Vec<Command>,
) -> Result<Vec<Reply>> {
    let expected = commands.len();

    // Queue everything, then a single flush puts the whole batch on the wire
    for command in commands {
        framed.feed(command).await?;
    }
    SinkExt::<Command>::flush(framed).await?;

    let mut replies = Vec::with_capacity(expected);
    while replies.len() < expected {
        match framed.next().await {
            Some(reply) => replies.push(reply?),
            None => {
                return Err(Error::transport(
                    "connection closed by peer",
                    format!("{} of {} replies received", replies.len(), expected),
                ));
            }
        }
    }

    Ok(replies)
}

#[async_trait]
impl Connection for RespConnection {
    async fn send(&mut self, command: Command) -> Result<Reply> {
        self.exchange(vec![command])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("missing reply".to_string()))
    }

    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.exchange(commands).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing connection to {}", self.peer);
        SinkExt::<Command>::close(&mut self.framed).await
    }
}

impl std::fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespConnection")
            .field("peer", &self.peer)
            .field("io_timeout", &self.io_timeout)
            .field("poisoned", &self.poisoned)
            .field("closed", &self.closed)
            .finish()
    }
}
