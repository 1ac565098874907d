// Framing of Tuya messages. Every message, in both directions, looks
// like this (all integers big endian):
//
//   prefix    u32   0x000055AA
//   sequence  u32
//   command   u32
//   length    u32   bytes that follow, including CRC and suffix
//   retcode   u32   only in messages from the device, and not always
//   payload   ...
//   crc       u32   CRC-32 of everything from prefix to payload
//   suffix    u32   0x0000AA55

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;

const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 8;

// Replies from a bulb are small. Anything bigger means we've lost
// sync with the stream.

const MAX_BODY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Control,
    Status,
    HeartBeat,
    DpQuery,
    ControlNew,
    Other(u32),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::Control => 0x07,
            Command::Status => 0x08,
            Command::HeartBeat => 0x09,
            Command::DpQuery => 0x0a,
            Command::ControlNew => 0x0d,
            Command::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0x07 => Command::Control,
            0x08 => Command::Status,
            0x09 => Command::HeartBeat,
            0x0a => Command::DpQuery,
            0x0d => Command::ControlNew,
            other => Command::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub command: Command,
    pub ret_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(seq: u32, command: Command, payload: Vec<u8>) -> Self {
        Frame {
            seq,
            command,
            ret_code: None,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let ret_len = if self.ret_code.is_some() { 4 } else { 0 };
        let body_len = ret_len + self.payload.len() + TRAILER_LEN;
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);

        buf.extend_from_slice(&PREFIX.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.command.code().to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        if let Some(code) = self.ret_code {
            buf.extend_from_slice(&code.to_be_bytes());
        }
        buf.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&buf);

        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(&SUFFIX.to_be_bytes());
        buf
    }

    // Decodes one complete message. `from_device` enables detection of
    // the return code: the device includes it when its top three bytes
    // are zero, which never happens for an encrypted or versioned
    // payload.

    pub fn decode(buf: &[u8], from_device: bool) -> Result<Frame> {
        if buf.len() < HEADER_LEN + TRAILER_LEN {
            return Err(desync(format!("short frame ({} bytes)", buf.len())));
        }

        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        if word(0) != PREFIX {
            return Err(desync(format!("bad prefix {:#010x}", word(0))));
        }

        let body_len = word(12) as usize;

        if body_len < TRAILER_LEN || HEADER_LEN + body_len != buf.len() {
            return Err(desync(format!(
                "length field {body_len} does not match frame of {} bytes",
                buf.len()
            )));
        }

        let crc_at = buf.len() - TRAILER_LEN;

        if word(crc_at + 4) != SUFFIX {
            return Err(desync(format!("bad suffix {:#010x}", word(crc_at + 4))));
        }

        let crc = crc32fast::hash(&buf[..crc_at]);

        if word(crc_at) != crc {
            return Err(desync(format!(
                "CRC mismatch (got {:#010x}, computed {crc:#010x})",
                word(crc_at)
            )));
        }

        let mut body = &buf[HEADER_LEN..crc_at];
        let mut ret_code = None;

        if from_device && body.len() >= 4 && body[..3] == [0, 0, 0] {
            ret_code = Some(word(HEADER_LEN));
            body = &body[4..];
        }

        Ok(Frame {
            seq: word(4),
            command: Command::from_code(word(8)),
            ret_code,
            payload: body.to_vec(),
        })
    }
}

// Takes one complete message off the front of `buf`. Returns `None`
// while more bytes are needed; bytes of a partial message stay in the
// buffer for the next call.

pub fn split_frame(buf: &mut Vec<u8>, from_device: bool) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let prefix = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if prefix != PREFIX {
        return Err(desync(format!("bad prefix {prefix:#010x}")));
    }

    let total = HEADER_LEN + body_len(&buf[..HEADER_LEN])?;

    if buf.len() < total {
        return Ok(None);
    }

    let frame = Frame::decode(&buf[..total], from_device)?;

    buf.drain(..total);
    Ok(Some(frame))
}

// Reads one message from the stream. Header first, so we know how much
// more to read. Not cancel safe: a partly read message is lost.

pub async fn read_frame<R>(rx: &mut R, from_device: bool) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; HEADER_LEN];

    rx.read_exact(&mut buf).await?;

    let body_len = body_len(&buf)?;

    buf.resize(HEADER_LEN + body_len, 0);
    rx.read_exact(&mut buf[HEADER_LEN..]).await?;
    Frame::decode(&buf, from_device)
}

fn body_len(header: &[u8]) -> Result<usize> {
    let len = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;

    if len > MAX_BODY {
        return Err(desync(format!(
            "frame length ({len}) is greater than {MAX_BODY}"
        )));
    }
    Ok(len)
}

fn desync(msg: String) -> Error {
    Error::Desync(msg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let frame = Frame::request(1, Command::DpQuery, vec![0xde, 0xad]);
        let buf = frame.encode();

        assert_eq!(buf.len(), 16 + 2 + 8);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x55, 0xaa]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0x0a]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 10]);
        assert_eq!(&buf[buf.len() - 4..], &[0x00, 0x00, 0xaa, 0x55]);
        assert_eq!(Frame::decode(&buf, false).unwrap(), frame);
    }

    #[test]
    fn test_return_code_detection() {
        let reply = Frame {
            seq: 7,
            command: Command::Control,
            ret_code: Some(0),
            payload: b"3.3".to_vec(),
        };
        let decoded = Frame::decode(&reply.encode(), true).unwrap();

        assert_eq!(decoded, reply);

        // Same bytes, read as a client message, keep the code in the payload.
        let raw = Frame::decode(&reply.encode(), false).unwrap();

        assert_eq!(raw.ret_code, None);
        assert_eq!(raw.payload.len(), 7);
    }

    #[test]
    fn test_corruption_is_rejected() {
        let mut buf = Frame::request(3, Command::Control, b"payload".to_vec()).encode();

        buf[18] ^= 0xff;
        assert!(matches!(
            Frame::decode(&buf, false),
            Err(Error::Desync(_))
        ));

        let mut buf = Frame::request(3, Command::Control, vec![]).encode();

        buf[0] = 0x12;
        assert!(matches!(
            Frame::decode(&buf, false),
            Err(Error::Desync(_))
        ));
        assert!(Frame::decode(&buf[..10], false).is_err());
    }

    #[test]
    fn test_unknown_command_survives() {
        assert_eq!(Command::from_code(0x12), Command::Other(0x12));
        assert_eq!(Command::Other(0x12).code(), 0x12);
        assert_eq!(Command::from_code(0x0d), Command::ControlNew);
    }

    #[test]
    fn test_split_frame_waits_for_the_rest() {
        let first = Frame::request(1, Command::Status, b"one".to_vec());
        let second = Frame::request(2, Command::DpQuery, b"two".to_vec());
        let bytes: Vec<u8> = first.encode().into_iter().chain(second.encode()).collect();
        let mut buf = bytes[..20].to_vec();

        assert_eq!(split_frame(&mut buf, false).unwrap(), None);
        assert_eq!(buf.len(), 20);

        buf.extend_from_slice(&bytes[20..]);

        assert_eq!(split_frame(&mut buf, false).unwrap(), Some(first));
        assert_eq!(split_frame(&mut buf, false).unwrap(), Some(second));
        assert!(buf.is_empty());
        assert_eq!(split_frame(&mut buf, false).unwrap(), None);
    }

    #[test]
    fn test_split_frame_rejects_garbage() {
        let mut buf = vec![0xde; 24];

        assert!(matches!(
            split_frame(&mut buf, true),
            Err(Error::Desync(_))
        ));

        let mut buf = Frame::request(1, Command::Status, vec![]).encode();

        buf[12..16].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
        assert!(matches!(
            split_frame(&mut buf, true),
            Err(Error::Desync(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let first = Frame::request(1, Command::Status, b"one".to_vec());
        let second = Frame::request(2, Command::DpQuery, b"two".to_vec());
        let mut bytes = first.encode();

        bytes.extend(second.encode());

        let mut rx = &bytes[..];

        assert_eq!(read_frame(&mut rx, false).await.unwrap(), first);
        assert_eq!(read_frame(&mut rx, false).await.unwrap(), second);
        assert!(matches!(read_frame(&mut rx, false).await, Err(Error::Io(_))));
    }
}
