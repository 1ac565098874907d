/*!
 # Tuya local protocol link

 A minimal client for protocol version 3.3 over a persistent TCP
 connection: framed messages with a CRC, JSON bodies encrypted with the
 device's local key. Only the requests a white-light bulb needs are
 implemented: reading the data points and writing them.

 The link keeps the socket open between requests. Replies are matched to
 requests by sequence number: unsolicited status pushes, heartbeats and
 late answers to earlier requests are skipped. Incoming bytes are
 buffered on the link, so a reply cut short by a timeout is completed by
 the next read instead of throwing the stream out of step.
*/

pub mod crypt;
pub mod frame;
pub mod payload;

use std::io;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{BulbConfig, LocalKey};
use crate::session::{Connector, DeviceLink, SessionOptions};
use crate::state::Dps;
use crate::{Error, Result};

use crypt::Cipher;
use frame::{Command, Frame};

/// Clear-text header ("3.3" plus 12 bytes) in front of versioned payloads
pub const VERSION_HEADER_LEN: usize = 15;

// Ids of bulbs that may need the "device22" query variant.

const DEVICE22_ID_LEN: usize = 22;

/// Decoded reply body
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Plain acknowledgement
    Empty,
    /// JSON document
    Json(Value),
    /// Anything else, usually an error message from the device
    Text(String),
}

/// A live, persistent connection to one bulb
pub struct TuyaLink {
    stream: TcpStream,
    device_id: String,
    version_tag: String,
    cipher: Cipher,
    options: SessionOptions,
    seq: u32,
    device22: bool,
    rx_buf: Vec<u8>,
}

impl TuyaLink {
    /// Opens the TCP session to the bulb described by `config`.
    #[instrument(skip(config, options), fields(addr = %config.endpoint(options.port)))]
    pub async fn open(config: &BulbConfig, options: &SessionOptions) -> Result<TuyaLink> {
        if !config.version.is_supported() {
            return Err(Error::InvalidConfig(format!(
                "protocol {} is not supported",
                config.version
            )));
        }

        let cipher = Cipher::new(config.local_key.as_bytes()).ok_or_else(|| {
            Error::InvalidConfig(format!("local key must be {} bytes", LocalKey::LEN))
        })?;
        let addr = config.endpoint(options.port);

        debug!("Opening TCP session");

        let stream = match time::timeout(options.timeout, TcpStream::connect(addr.as_str())).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::Connect { addr, source }),
            Err(_) => return Err(Error::Timeout(options.timeout)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }

        Ok(TuyaLink {
            stream,
            device_id: config.device_id.clone(),
            version_tag: config.version.to_string(),
            cipher,
            options: *options,
            seq: 0,
            device22: false,
            rx_buf: Vec::new(),
        })
    }

    /// Whether the link switched to the "device22" query variant
    pub fn is_device22(&self) -> bool {
        self.device22
    }

    // Encrypts a body and adds the version header where the command
    // expects one.

    fn seal(&self, command: Command, body: &Value) -> Vec<u8> {
        let enc = self.cipher.encrypt(body.to_string().as_bytes());

        match command {
            Command::DpQuery | Command::HeartBeat => enc,
            _ => {
                let mut out = Vec::with_capacity(VERSION_HEADER_LEN + enc.len());

                out.extend_from_slice(self.version_tag.as_bytes());
                out.resize(VERSION_HEADER_LEN, 0);
                out.extend_from_slice(&enc);
                out
            }
        }
    }

    /// Strips the version header, decrypts and parses a reply payload.
    pub fn open_reply(&self, frame: &Frame) -> Reply {
        let mut data = &frame.payload[..];

        if data.starts_with(self.version_tag.as_bytes()) {
            data = data.get(VERSION_HEADER_LEN..).unwrap_or_default();
        }
        if data.is_empty() {
            return Reply::Empty;
        }

        // Some error messages arrive unencrypted.
        let clear = self.cipher.decrypt(data).unwrap_or_else(|| data.to_vec());

        match serde_json::from_slice(&clear) {
            Ok(value) => Reply::Json(value),
            Err(_) => Reply::Text(String::from_utf8_lossy(&clear).trim().to_string()),
        }
    }

    // A write that times out may have left part of a frame on the wire,
    // so the link cannot be used afterwards.

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let out = frame.encode();
        let timeout = self.options.timeout;
        let stream = &mut self.stream;

        trace!(
            "Sending frame seq={} command={:?} ({} bytes)",
            frame.seq,
            frame.command,
            out.len()
        );

        match time::timeout(timeout, async {
            stream.write_all(&out).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Desync(format!(
                "write of frame {} did not complete within {timeout:?}",
                frame.seq
            ))),
        }
    }

    // Cancel safe: bytes already received stay in `rx_buf`.

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = frame::split_frame(&mut self.rx_buf, true)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.rx_buf).await? == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "bulb closed the connection",
                )));
            }
        }
    }

    async fn read_until(&mut self, accept: fn(&Frame) -> bool, sent: &[u32]) -> Result<Frame> {
        loop {
            let frame = self.next_frame().await?;

            if !sent.contains(&frame.seq) {
                trace!(
                    "Skipping frame seq={} command={:?}, not an answer to {:?}",
                    frame.seq,
                    frame.command,
                    sent
                );
                continue;
            }
            if accept(&frame) {
                trace!(
                    "Accepted reply seq={} command={:?} ret={:?}",
                    frame.seq,
                    frame.command,
                    frame.ret_code
                );
                return Ok(frame);
            }
            trace!(
                "Skipping unsolicited frame seq={} command={:?}",
                frame.seq,
                frame.command
            );
        }
    }

    // Sends a request and waits for the reply. A timed out request is
    // re-sent on the same socket up to `retry_limit` times, each time with
    // a new sequence number; a late reply to any of them is accepted.

    async fn exchange(
        &mut self,
        command: Command,
        body: &Value,
        accept: fn(&Frame) -> bool,
    ) -> Result<Frame> {
        let payload = self.seal(command, body);
        let mut attempt = 0u8;
        let mut sent = Vec::with_capacity(self.options.retry_limit as usize + 1);

        loop {
            // Sequence 0 is what the bulb uses for pushes.
            self.seq = self.seq.wrapping_add(1).max(1);
            sent.push(self.seq);
            self.send(&Frame::request(self.seq, command, payload.clone()))
                .await?;

            match time::timeout(self.options.timeout, self.read_until(accept, &sent)).await {
                Ok(result) => return result,
                Err(_) if attempt < self.options.retry_limit => {
                    attempt += 1;
                    warn!(
                        "No reply to {:?} within {:?}, retrying ({}/{})",
                        command, self.options.timeout, attempt, self.options.retry_limit
                    );
                }
                Err(_) => return Err(Error::Timeout(self.options.timeout)),
            }
        }
    }

    async fn query_device22(&mut self) -> Result<Dps> {
        let body = payload::query_device22(&self.device_id, &payload::timestamp());
        let reply = self
            .exchange(Command::ControlNew, &body, |f| {
                f.command == Command::Status
                    || (f.command == Command::ControlNew && f.payload.len() > VERSION_HEADER_LEN)
            })
            .await?;

        match self.open_reply(&reply) {
            Reply::Json(value) => payload::dps_of(&value)
                .ok_or_else(|| Error::MalformedResponse("reply carries no data points".into())),
            Reply::Text(text) => Err(Error::MalformedResponse(text)),
            Reply::Empty => Err(Error::MalformedResponse("empty reply to status query".into())),
        }
    }
}

#[async_trait]
impl DeviceLink for TuyaLink {
    async fn status(&mut self) -> Result<Dps> {
        if self.device22 {
            return self.query_device22().await;
        }

        let body = payload::query(&self.device_id, &payload::timestamp());
        let reply = self
            .exchange(Command::DpQuery, &body, |f| f.command == Command::DpQuery)
            .await?;

        match self.open_reply(&reply) {
            Reply::Json(value) => payload::dps_of(&value)
                .ok_or_else(|| Error::MalformedResponse("reply carries no data points".into())),
            Reply::Text(text)
                if text.contains("data unvalid") && self.device_id.len() == DEVICE22_ID_LEN =>
            {
                info!("Bulb rejected the plain status query, switching to device22 queries");
                self.device22 = true;
                self.query_device22().await
            }
            Reply::Text(text) => Err(Error::MalformedResponse(text)),
            Reply::Empty => Err(Error::MalformedResponse("empty reply to status query".into())),
        }
    }

    async fn set_dps(&mut self, dps: Dps) -> Result<()> {
        let body = payload::control(&self.device_id, &dps, &payload::timestamp());
        let reply = self
            .exchange(Command::Control, &body, |f| {
                matches!(f.command, Command::Control | Command::Status)
            })
            .await?;

        if let Some(code) = reply.ret_code.filter(|c| *c != 0) {
            return Err(Error::MalformedResponse(format!(
                "bulb rejected command (code {code})"
            )));
        }

        match self.open_reply(&reply) {
            Reply::Text(text) => Err(Error::MalformedResponse(text)),
            Reply::Empty | Reply::Json(_) => Ok(()),
        }
    }
}

/// Opens [`TuyaLink`]s over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Link = TuyaLink;

    async fn connect(&self, config: &BulbConfig, options: &SessionOptions) -> Result<TuyaLink> {
        TuyaLink::open(config, options).await
    }
}
