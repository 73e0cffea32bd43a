//! Wire format for the lyrics request/response protocol carried over a
//! MyCP (or fallback) byte stream. Messages are framed with an 8-byte
//! little-endian length prefix, the way `neutronium::net::channel::Channel`
//! frames its own frames, since the underlying stream is an unstructured
//! byte pipe.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use mycp::{Error, Result, Stream};

pub const GET_SONG_REQ: u8 = 0;
pub const GET_LIST_REQ: u8 = 1;
pub const ADD_SONG_REQ: u8 = 2;
pub const GET_SONG_RESP: u8 = 64;
pub const GET_LIST_RESP: u8 = 65;
pub const ADD_SONG_RESP: u8 = 66;

/// Largest single framed message this protocol will read; guards against a
/// malformed or hostile length prefix forcing an unbounded allocation.
const MAX_MESSAGE_SIZE: u64 = 1 << 20;

/// `author`+`song` keys a lyric the way `get_song_request`/`add_song_request`
/// do in `protocol.h` — not a single flattened title — so two different
/// authors can each have a song of the same name without colliding.
#[derive(Debug, Clone)]
pub enum Request {
    GetSong { author: String, song: String },
    GetList { author: String },
    AddSong { author: String, song: String, lyrics: String },
}

#[derive(Debug, Clone)]
pub enum Response {
    GetSong { lyrics: Option<String> },
    GetList { songs: Vec<String> },
    AddSong { ok: bool },
}

fn write_string(out: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    out.write_u16::<LittleEndian>(bytes.len() as u16)?;
    out.write_all(bytes)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u16::<LittleEndian>().map_err(|_| malformed("truncated string length"))? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|_| malformed("truncated string bytes"))?;
    String::from_utf8(bytes).map_err(|_| malformed("string is not valid UTF-8"))
}

fn malformed(reason: &str) -> Error {
    Error::IoError(format!("malformed lyrics message: {reason}"))
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Request::GetSong { author, song } => {
                body.write_u8(GET_SONG_REQ).unwrap();
                write_string(&mut body, author).unwrap();
                write_string(&mut body, song).unwrap();
            }
            Request::GetList { author } => {
                body.write_u8(GET_LIST_REQ).unwrap();
                write_string(&mut body, author).unwrap();
            }
            Request::AddSong { author, song, lyrics } => {
                body.write_u8(ADD_SONG_REQ).unwrap();
                write_string(&mut body, author).unwrap();
                write_string(&mut body, song).unwrap();
                write_string(&mut body, lyrics).unwrap();
            }
        }
        body
    }

    pub fn decode(bytes: &[u8]) -> Result<Request> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.read_u8().map_err(|_| malformed("empty message"))?;
        match tag {
            GET_SONG_REQ => Ok(Request::GetSong {
                author: read_string(&mut cursor)?,
                song: read_string(&mut cursor)?,
            }),
            GET_LIST_REQ => Ok(Request::GetList { author: read_string(&mut cursor)? }),
            ADD_SONG_REQ => Ok(Request::AddSong {
                author: read_string(&mut cursor)?,
                song: read_string(&mut cursor)?,
                lyrics: read_string(&mut cursor)?,
            }),
            other => Err(malformed(&format!("unknown request tag {other}"))),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Response::GetSong { lyrics } => {
                body.write_u8(GET_SONG_RESP).unwrap();
                body.write_u8(lyrics.is_some() as u8).unwrap();
                if let Some(lyrics) = lyrics {
                    write_string(&mut body, lyrics).unwrap();
                }
            }
            Response::GetList { songs } => {
                body.write_u8(GET_LIST_RESP).unwrap();
                body.write_u16::<LittleEndian>(songs.len() as u16).unwrap();
                for song in songs {
                    write_string(&mut body, song).unwrap();
                }
            }
            Response::AddSong { ok } => {
                body.write_u8(ADD_SONG_RESP).unwrap();
                body.write_u8(*ok as u8).unwrap();
            }
        }
        body
    }

    pub fn decode(bytes: &[u8]) -> Result<Response> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.read_u8().map_err(|_| malformed("empty message"))?;
        match tag {
            GET_SONG_RESP => {
                let found = cursor.read_u8().map_err(|_| malformed("truncated found flag"))?;
                let lyrics = if found != 0 { Some(read_string(&mut cursor)?) } else { None };
                Ok(Response::GetSong { lyrics })
            }
            GET_LIST_RESP => {
                let count = cursor.read_u16::<LittleEndian>().map_err(|_| malformed("truncated list count"))?;
                let mut songs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    songs.push(read_string(&mut cursor)?);
                }
                Ok(Response::GetList { songs })
            }
            ADD_SONG_RESP => {
                let ok = cursor.read_u8().map_err(|_| malformed("truncated ok flag"))?;
                Ok(Response::AddSong { ok: ok != 0 })
            }
            other => Err(malformed(&format!("unknown response tag {other}"))),
        }
    }
}

/// Writes one length-prefixed frame to `stream`. The length prefix is a
/// uint64 per the external frame format (§6), not sized to the payload's
/// own u16 string-length fields.
pub fn send_frame(stream: &Stream, payload: &[u8]) -> Result<()> {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
    framed.extend_from_slice(payload);
    stream.send(&framed)
}

/// Reads one length-prefixed frame from `stream`, blocking until it has
/// arrived in full.
pub fn recv_frame(stream: &Stream) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 8];
    stream.recv(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_MESSAGE_SIZE {
        return Err(malformed("frame exceeds maximum message size"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.recv(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_get_song_request() {
        let req = Request::GetSong { author: "Queen".into(), song: "Bohemian Rhapsody".into() };
        let decoded = Request::decode(&req.encode()).unwrap();
        match decoded {
            Request::GetSong { author, song } => {
                assert_eq!(author, "Queen");
                assert_eq!(song, "Bohemian Rhapsody");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_get_list_request() {
        let req = Request::GetList { author: "Queen".into() };
        let decoded = Request::decode(&req.encode()).unwrap();
        match decoded {
            Request::GetList { author } => assert_eq!(author, "Queen"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_get_list_response() {
        let resp = Response::GetList { songs: vec!["A".into(), "B".into()] };
        let decoded = Response::decode(&resp.encode()).unwrap();
        match decoded {
            Response::GetList { songs } => assert_eq!(songs, vec!["A".to_string(), "B".to_string()]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn get_song_response_distinguishes_not_found() {
        let resp = Response::GetSong { lyrics: None };
        let decoded = Response::decode(&resp.encode()).unwrap();
        match decoded {
            Response::GetSong { lyrics } => assert!(lyrics.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_request_tag() {
        assert!(Request::decode(&[255]).is_err());
    }
}
