use crate::error::{FileServerError, FileServerResult};

pub const OP_STAT: u8 = 1;
pub const OP_READ: u8 = 2;
pub const OP_READDIR: u8 = 3;

pub const STATUS_OK: u8 = 0;
pub const STATUS_NO_ENTRY: u8 = 1;
pub const STATUS_IO: u8 = 2;

/// Server-side cap on a single read, regardless of what the guest asks for.
pub const MAX_READ_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Request {
    Stat(String),
    Read { path: String, offset: u64, length: u32 },
    Readdir(String),
}

/// Parse `[1-byte opcode][opcode-specific body]`.
pub fn decode_request(frame: &[u8]) -> FileServerResult<Request> {
    let (&opcode, body) = frame
        .split_first()
        .ok_or(FileServerError::Malformed("empty frame"))?;
    let mut cursor = 0usize;
    match opcode {
        OP_STAT => Ok(Request::Stat(read_path(body, &mut cursor)?)),
        OP_READ => {
            let path = read_path(body, &mut cursor)?;
            let offset = read_u64(body, &mut cursor)?;
            let length = read_u32(body, &mut cursor)?.min(MAX_READ_LEN);
            Ok(Request::Read { path, offset, length })
        }
        OP_READDIR => Ok(Request::Readdir(read_path(body, &mut cursor)?)),
        other => Err(FileServerError::UnknownOpcode(other)),
    }
}

fn read_path(buf: &[u8], cursor: &mut usize) -> FileServerResult<String> {
    let len = read_u16(buf, cursor)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(FileServerError::Malformed("path truncated"))?;
    *cursor += len;
    String::from_utf8(bytes.to_vec()).map_err(|_| FileServerError::Malformed("path is not valid UTF-8"))
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> FileServerResult<u16> {
    let bytes: [u8; 2] = buf
        .get(*cursor..*cursor + 2)
        .ok_or(FileServerError::Malformed("truncated u16"))?
        .try_into()
        .map_err(|_| FileServerError::Malformed("truncated u16"))?;
    *cursor += 2;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> FileServerResult<u32> {
    let bytes: [u8; 4] = buf
        .get(*cursor..*cursor + 4)
        .ok_or(FileServerError::Malformed("truncated u32"))?
        .try_into()
        .map_err(|_| FileServerError::Malformed("truncated u32"))?;
    *cursor += 4;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> FileServerResult<u64> {
    let bytes: [u8; 8] = buf
        .get(*cursor..*cursor + 8)
        .ok_or(FileServerError::Malformed("truncated u64"))?
        .try_into()
        .map_err(|_| FileServerError::Malformed("truncated u64"))?;
    *cursor += 8;
    Ok(u64::from_be_bytes(bytes))
}

pub fn encode_status(status: u8) -> Vec<u8> {
    vec![status]
}

pub fn encode_stat_ok(mode: u32, size: u64, mtime: u64, is_dir: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 8 + 8 + 1);
    out.push(STATUS_OK);
    out.extend_from_slice(&mode.to_be_bytes());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&mtime.to_be_bytes());
    out.push(u8::from(is_dir));
    out
}

pub fn encode_read_ok(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + data.len());
    out.push(STATUS_OK);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

pub fn encode_readdir_ok(entries: &[(String, bool)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 2);
    out.push(STATUS_OK);
    out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (name, is_dir) in entries {
        let name_bytes = name.as_bytes();
        out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(name_bytes);
        out.push(u8::from(*is_dir));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_stat_request() {
        let mut frame = vec![OP_STAT];
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.extend_from_slice(b"foo");
        match decode_request(&frame).unwrap_or_else(|e| panic!("{e}")) {
            Request::Stat(path) => assert_eq!(path, "foo"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn decodes_a_read_request_and_caps_length() {
        let mut frame = vec![OP_READ];
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.extend_from_slice(b"bar");
        frame.extend_from_slice(&10u64.to_be_bytes());
        frame.extend_from_slice(&(MAX_READ_LEN * 4).to_be_bytes());
        match decode_request(&frame).unwrap_or_else(|e| panic!("{e}")) {
            Request::Read { path, offset, length } => {
                assert_eq!(path, "bar");
                assert_eq!(offset, 10);
                assert_eq!(length, MAX_READ_LEN);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn rejects_an_empty_frame() {
        assert!(decode_request(&[]).is_err());
    }

    #[test]
    fn rejects_a_truncated_path() {
        let mut frame = vec![OP_STAT];
        frame.extend_from_slice(&50u16.to_be_bytes());
        frame.extend_from_slice(b"short");
        assert!(decode_request(&frame).is_err());
    }

    #[test]
    fn encode_readdir_ok_round_trips_names() {
        let entries = vec![("a.txt".to_string(), false), ("sub".to_string(), true)];
        let body = encode_readdir_ok(&entries);
        assert_eq!(body[0], STATUS_OK);
        let count = u16::from_be_bytes([body[1], body[2]]);
        assert_eq!(count, 2);
    }
}
