//! Replication-mode wire client.
//!
//! Speaks the PostgreSQL frontend/backend protocol directly over TCP with
//! `replication=database`, which is what unlocks the walsender grammar
//! (`IDENTIFY_SYSTEM`, `CREATE_REPLICATION_SLOT`, `START_REPLICATION`) and
//! CopyBoth streaming. Regular catalog queries go through `tokio-postgres`
//! on a separate connection; see [`super::catalog`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, SslMode};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::postgres::frame::{ReplicationFrame, StandbyStatusUpdate};

// Authentication request codes from the backend 'R' message.
const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;

/// A connected replication-mode client, pre-CopyBoth.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
    config: ConnectionConfig,
}

impl ReplicationClient {
    /// Connect and authenticate in replication mode.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        if matches!(config.ssl_mode, SslMode::Require) {
            return Err(Error::Config(
                "ssl=require is not supported by the replication client; \
                 terminate TLS in front of the engine or use disable/prefer"
                    .into(),
            ));
        }

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            user = %config.user,
            "connecting replication client"
        );

        let stream = timeout(
            config.connect_timeout(),
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::Connection(format!("connect timeout to {}:{}", config.host, config.port)))?
        .map_err(Error::Io)?;
        let mut stream = BufReader::new(stream);

        let params = [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "pg-relay"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.iter().copied(), &mut buf).map_err(Error::Io)?;
        stream.get_mut().write_all(&buf).await?;
        stream.get_mut().flush().await?;

        authenticate(&mut stream, config).await?;

        // Drain parameter status / backend key data until ReadyForQuery.
        loop {
            let (tag, body) = read_backend_message(&mut stream).await?;
            match tag {
                b'Z' => break,
                b'E' => return Err(Error::Connection(error_response_text(&body))),
                _ => {}
            }
        }

        debug!("replication client ready");
        Ok(Self {
            stream,
            config: config.clone(),
        })
    }

    /// Create the logical slot with the pgoutput plugin. An existing slot
    /// with the same name is fine: the engine resumes from its position.
    pub async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        let query = format!("CREATE_REPLICATION_SLOT {slot_name} LOGICAL pgoutput NOEXPORT_SNAPSHOT");
        match self.simple_query(&query).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    info!(slot = %slot_name, consistent_point = ?row.get(1), "created replication slot");
                }
                Ok(())
            }
            Err(Error::Connection(msg)) if msg.contains("already exists") => {
                debug!(slot = %slot_name, "replication slot already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `IDENTIFY_SYSTEM`: returns (systemid, timeline, xlogpos).
    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".into()))?;

        let column = |i: usize| row.get(i).and_then(|v| v.clone());
        Ok(SystemIdentity {
            system_id: column(0).unwrap_or_default(),
            timeline: column(1).and_then(|s| s.parse::<i32>().ok()).unwrap_or(1),
            xlogpos: column(2)
                .and_then(|s| s.parse::<Lsn>().ok())
                .unwrap_or(Lsn::ZERO),
        })
    }

    /// Issue `START_REPLICATION` and switch into CopyBoth mode.
    ///
    /// `start_lsn` of zero lets the server resume from the slot's own
    /// confirmed position.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {slot_name} LOGICAL {start_lsn} \
             (proto_version '1', publication_names '\"{publication}\"')"
        );
        debug!(%query, "starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf).map_err(Error::Io)?;
        self.stream.get_mut().write_all(&buf).await?;
        self.stream.get_mut().flush().await?;

        loop {
            let (tag, body) = read_backend_message(&mut self.stream).await?;
            match tag {
                // CopyBothResponse
                b'W' => {
                    info!(slot = %slot_name, publication = %publication, "entered CopyBoth mode");
                    return Ok(ReplicationStream {
                        stream: self.stream,
                    });
                }
                b'E' => {
                    return Err(Error::Connection(format!(
                        "START_REPLICATION failed: {}",
                        error_response_text(&body)
                    )));
                }
                // NoticeResponse etc. are informational here.
                _ => {}
            }
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run a walsender-grammar command, collecting textual row data.
    async fn simple_query(&mut self, query: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf).map_err(Error::Io)?;
        self.stream.get_mut().write_all(&buf).await?;
        self.stream.get_mut().flush().await?;

        let mut rows = Vec::new();
        let mut error: Option<String> = None;
        loop {
            let (tag, body) = read_backend_message(&mut self.stream).await?;
            match tag {
                b'D' => rows.push(parse_data_row(&body)?),
                b'E' => error = Some(error_response_text(&body)),
                // Command complete and row description carry nothing we need.
                b'Z' => break,
                _ => {}
            }
        }

        match error {
            Some(msg) => Err(Error::Connection(msg)),
            None => Ok(rows),
        }
    }
}

/// System identification returned by `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
}

/// The CopyBoth half: length-prefixed CopyData frames in both directions.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Read the next replication frame. Returns `None` on CopyDone.
    pub async fn next_frame(&mut self) -> Result<Option<ReplicationFrame>> {
        loop {
            let (tag, body) = read_backend_message(&mut self.stream).await?;
            match tag {
                // CopyData: the payload is a replication frame.
                b'd' => return ReplicationFrame::parse(Bytes::from(body)).map(Some),
                // CopyDone: server is shutting the stream down.
                b'c' => return Ok(None),
                b'E' => return Err(Error::Connection(error_response_text(&body))),
                other => {
                    warn!(tag = %(other as char), "unexpected message inside CopyBoth stream");
                }
            }
        }
    }

    /// Send a standby status update wrapped in CopyData.
    pub async fn send_status_update(&mut self, update: StandbyStatusUpdate) -> Result<()> {
        let payload = update.encode();
        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.get_mut().write_all(&frame).await?;
        self.stream.get_mut().flush().await?;
        debug!(flushed = %update.flushed, "sent standby status update");
        Ok(())
    }
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    config: &ConnectionConfig,
) -> Result<()> {
    loop {
        let (tag, body) = read_backend_message(stream).await?;
        match tag {
            b'R' => {
                let mut cursor = &body[..];
                if cursor.remaining() < 4 {
                    return Err(Error::Protocol("authentication message too short".into()));
                }
                match cursor.get_i32() {
                    AUTH_OK => {
                        debug!("authentication ok");
                        return Ok(());
                    }
                    AUTH_CLEARTEXT => {
                        send_password(stream, config.password.as_bytes()).await?;
                    }
                    AUTH_MD5 => {
                        if cursor.remaining() < 4 {
                            return Err(Error::Protocol("md5 auth message missing salt".into()));
                        }
                        let mut salt = [0u8; 4];
                        cursor.copy_to_slice(&mut salt);
                        let hashed = md5_password(&config.user, &config.password, &salt);
                        send_password(stream, hashed.as_bytes()).await?;
                    }
                    AUTH_SASL => {
                        return Err(Error::Authentication(
                            "server requires SCRAM; configure md5 or password auth \
                             for the replication role"
                                .into(),
                        ));
                    }
                    other => {
                        return Err(Error::Authentication(format!(
                            "unsupported authentication request: {other}"
                        )));
                    }
                }
            }
            b'E' => return Err(Error::Authentication(error_response_text(&body))),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during authentication: '{}'",
                    other as char
                )));
            }
        }
    }
}

async fn send_password(stream: &mut BufReader<TcpStream>, password: &[u8]) -> Result<()> {
    let mut buf = BytesMut::new();
    frontend::password_message(password, &mut buf).map_err(Error::Io)?;
    stream.get_mut().write_all(&buf).await?;
    stream.get_mut().flush().await?;
    Ok(())
}

/// `md5` || md5(md5(password || user) || salt), per the protocol docs.
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// One backend message: tag byte, i32 length (inclusive), body.
async fn read_backend_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let tag = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length {len}")));
    }
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// DataRow body: u16 column count, then per column an i32 length (-1 for
/// NULL) and that many bytes of text.
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>> {
    let mut cursor = body;
    if cursor.remaining() < 2 {
        return Err(Error::Protocol("DataRow body too short".into()));
    }
    let ncols = cursor.get_u16();
    let mut row = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        if cursor.remaining() < 4 {
            return Err(Error::Protocol("DataRow column header truncated".into()));
        }
        let len = cursor.get_i32();
        if len < 0 {
            row.push(None);
        } else {
            let len = len as usize;
            if cursor.remaining() < len {
                return Err(Error::Protocol("DataRow column value truncated".into()));
            }
            row.push(Some(String::from_utf8_lossy(&cursor[..len]).into_owned()));
            cursor.advance(len);
        }
    }
    Ok(row)
}

/// Pull the human-readable message ('M' field) out of an ErrorResponse.
fn error_response_text(body: &[u8]) -> String {
    let mut cursor = body;
    while cursor.remaining() > 1 {
        let field = cursor.get_u8();
        if field == 0 {
            break;
        }
        let nul = match cursor.iter().position(|&b| b == 0) {
            Some(n) => n,
            None => break,
        };
        let value = String::from_utf8_lossy(&cursor[..nul]).into_owned();
        cursor.advance(nul + 1);
        if field == b'M' {
            return value;
        }
    }
    "server error (no message field)".into()
}
