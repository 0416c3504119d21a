//! Serialize/deserialize netfs frames into/from binary.
//!
//! Everything is big-endian. Frames carry no overall length: each field is
//! either fixed width or prefixed with its own `u32` length, and fields are
//! read back in exactly the order they were written.

use crate::{error::FsError, fcall::*, io_err, res};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Read, Result};
use std::mem;
use std::ops::Shl;
use std::time::SystemTime;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_len<R: Read + ?Sized>(r: &mut R) -> Result<usize> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_DATA_SIZE {
        return res!(io_err!(
            InvalidData,
            format!("Length prefix {} exceeds limit {}", len, MAX_DATA_SIZE)
        ));
    }
    Ok(len as usize)
}

/// Payload of the `UnexpectedEof` raised when a length-prefixed field is cut
/// short, telling the codec how many more bytes the field needs.
#[derive(Debug, thiserror::Error)]
#[error("Stream ended {missing} bytes short inside a field")]
struct Incomplete {
    missing: usize,
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(64 * 1024));
    Read::take(&mut *r, size as u64).read_to_end(&mut buf)?;
    if buf.len() < size {
        let missing = size - buf.len();
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, Incomplete { missing }));
    }
    Ok(buf)
}

fn missing_bytes(e: &io::Error) -> usize {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<Incomplete>())
        .map_or(1, |incomplete| incomplete.missing)
}

// Longest prefix of `msg` that fits the envelope without splitting a character.
fn truncate_message(msg: &str) -> &str {
    let max = ERROR_MAX as usize;
    if msg.len() <= max {
        return msg;
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i16::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i64::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u32).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Encodable for FileMode {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.bits().encode(w)
    }
}

impl Encodable for OpenFlags {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.bits().encode(w)
    }
}

impl Encodable for SystemTime {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        unix_secs(*self).encode(w)
    }
}

impl Encodable for FileInfo {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.name << &self.size << &self.mode << &self.modified {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// The error envelope
impl Encodable for Option<FsError> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match *self {
            None => ERROR_NIL.encode(w),
            Some(FsError::Eof) => ERROR_EOF.encode(w),
            Some(FsError::Message(ref msg)) => {
                let text = truncate_message(msg);
                let bytes = (text.len() as u16).encode(w)?;
                w.write_all(text.as_bytes())?;
                Ok(bytes + text.len())
            }
        }
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u32), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for FCall {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let buf = Encoder::new(w) << &(self.kind() as u8);
        let buf = match self.opcode() {
            Some(op) => buf << &(op as u8),
            None => buf,
        };

        let buf = match *self {
            Init { ref version } => buf << version,

            /*
             * Link management
             */
            TClose => buf,
            TPing => buf,
            RPing => buf,

            /*
             * Filesystem
             */
            TChmod { ref name, ref mode } => buf << name << mode,
            RChmod { ref error } => buf << error,
            TChtimes {
                ref name,
                ref atime,
                ref mtime,
            } => buf << name << atime << mtime,
            RChtimes { ref error } => buf << error,
            TMkdir { ref name, ref perm } => buf << name << perm,
            RMkdir { ref error } => buf << error,
            TMkdirAll { ref path, ref perm } => buf << path << perm,
            RMkdirAll { ref error } => buf << error,
            TRemove { ref name } => buf << name,
            RRemove { ref error } => buf << error,
            TRemoveAll { ref path } => buf << path,
            RRemoveAll { ref error } => buf << error,
            TRename {
                ref oldpath,
                ref newpath,
            } => buf << oldpath << newpath,
            RRename { ref error } => buf << error,
            TTruncate { ref name, ref size } => buf << name << size,
            RTruncate { ref error } => buf << error,
            TCreate { ref name } => buf << name,
            RCreate { ref fid, ref error } => buf << fid << error,
            TOpen { ref name } => buf << name,
            ROpen { ref fid, ref error } => buf << fid << error,
            TOpenFile {
                ref name,
                ref flags,
                ref perm,
            } => buf << name << flags << perm,
            ROpenFile { ref fid, ref error } => buf << fid << error,
            TLstat { ref name } => buf << name,
            RLstat { ref info, ref error } => buf << info << error,
            TStat { ref name } => buf << name,
            RStat { ref info, ref error } => buf << info << error,

            /*
             * Open file
             */
            TFileChmod { ref fid, ref mode } => buf << fid << mode,
            RFileChmod { ref error } => buf << error,
            TFileClose { ref fid } => buf << fid,
            RFileClose { ref error } => buf << error,
            TFileRead { ref fid, ref count } => buf << fid << count,
            RFileRead { ref data, ref error } => buf << data << error,
            TFileReadAt {
                ref fid,
                ref count,
                ref offset,
            } => buf << fid << count << offset,
            RFileReadAt { ref data, ref error } => buf << data << error,
            TFileReaddir { ref fid, ref n } => buf << fid << n,
            RFileReaddir {
                ref entries,
                ref error,
            } => buf << entries << error,
            TFileReaddirnames { ref fid, ref n } => buf << fid << n,
            RFileReaddirnames { ref names, ref error } => buf << names << error,
            TFileSeek {
                ref fid,
                ref offset,
                ref whence,
            } => buf << fid << offset << whence,
            RFileSeek {
                ref offset,
                ref error,
            } => buf << offset << error,
            TFileStat { ref fid } => buf << fid,
            RFileStat { ref info, ref error } => buf << info << error,
            TFileSync { ref fid } => buf << fid,
            RFileSync { ref error } => buf << error,
            TFileTruncate { ref fid, ref size } => buf << fid << size,
            RFileTruncate { ref error } => buf << error,
            TFileWrite { ref fid, ref data } => buf << fid << data,
            RFileWrite { ref count, ref error } => buf << count << error,
            TFileWriteAt {
                ref fid,
                ref data,
                ref offset,
            } => buf << fid << data << offset,
            RFileWriteAt { ref count, ref error } => buf << count << error,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<BigEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<BigEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<BigEndian>()
    }
}

impl Decodable for i8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i8()
    }
}

impl Decodable for i16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i16::<BigEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<BigEndian>()
    }
}

impl Decodable for i64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i64::<BigEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = read_len(r)?;
        String::from_utf8(read_exact(r, len)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = read_len(r)?;
        Ok(Data(read_exact(r, len)?))
    }
}

impl Decodable for FileMode {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(FileMode::from_bits_retain(Decodable::decode(r)?))
    }
}

impl Decodable for OpenFlags {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(OpenFlags::from_bits_retain(Decodable::decode(r)?))
    }
}

impl Decodable for SystemTime {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(from_unix_secs(Decodable::decode(r)?))
    }
}

impl Decodable for FileInfo {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(FileInfo {
            name: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            modified: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Option<FsError> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let marker: u16 = Decodable::decode(r)?;
        match marker {
            ERROR_NIL => Ok(None),
            ERROR_EOF => Ok(Some(FsError::Eof)),
            len if len <= ERROR_MAX => {
                let text = read_exact(r, len as usize)?;
                Ok(Some(FsError::Message(
                    String::from_utf8_lossy(&text).into_owned(),
                )))
            }
            other => res!(io_err!(
                InvalidData,
                format!("Undefined error marker: {:#06x}", other)
            )),
        }
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = read_len(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for FCall {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgKind::{Init, Request, Response};
        use crate::Opcode::*;

        let mut buf = r;

        let kind: u8 = decode!(buf);
        let kind = MsgKind::from_u8(kind)
            .ok_or_else(|| io_err!(InvalidData, format!("Unknown message kind: {}", kind)))?;
        if kind == Init {
            return Ok(FCall::Init {
                version: decode!(buf),
            });
        }

        let code: u8 = decode!(buf);
        let op = Opcode::from_u8(code)
            .ok_or_else(|| io_err!(InvalidData, format!("Unknown opcode: {}", code)))?;

        let body = match (kind, op) {
            /*
             * Link management
             */
            (Request, Close) => FCall::TClose,
            (Request, Ping) => FCall::TPing,
            (Response, Ping) => FCall::RPing,

            /*
             * Filesystem
             */
            (Request, Chmod) => FCall::TChmod {
                name: decode!(buf),
                mode: decode!(buf),
            },
            (Response, Chmod) => FCall::RChmod {
                error: decode!(buf),
            },
            (Request, Chtimes) => FCall::TChtimes {
                name: decode!(buf),
                atime: decode!(buf),
                mtime: decode!(buf),
            },
            (Response, Chtimes) => FCall::RChtimes {
                error: decode!(buf),
            },
            (Request, Mkdir) => FCall::TMkdir {
                name: decode!(buf),
                perm: decode!(buf),
            },
            (Response, Mkdir) => FCall::RMkdir {
                error: decode!(buf),
            },
            (Request, MkdirAll) => FCall::TMkdirAll {
                path: decode!(buf),
                perm: decode!(buf),
            },
            (Response, MkdirAll) => FCall::RMkdirAll {
                error: decode!(buf),
            },
            (Request, Remove) => FCall::TRemove { name: decode!(buf) },
            (Response, Remove) => FCall::RRemove {
                error: decode!(buf),
            },
            (Request, RemoveAll) => FCall::TRemoveAll { path: decode!(buf) },
            (Response, RemoveAll) => FCall::RRemoveAll {
                error: decode!(buf),
            },
            (Request, Rename) => FCall::TRename {
                oldpath: decode!(buf),
                newpath: decode!(buf),
            },
            (Response, Rename) => FCall::RRename {
                error: decode!(buf),
            },
            (Request, Truncate) => FCall::TTruncate {
                name: decode!(buf),
                size: decode!(buf),
            },
            (Response, Truncate) => FCall::RTruncate {
                error: decode!(buf),
            },
            (Request, Create) => FCall::TCreate { name: decode!(buf) },
            (Response, Create) => FCall::RCreate {
                fid: decode!(buf),
                error: decode!(buf),
            },
            (Request, Open) => FCall::TOpen { name: decode!(buf) },
            (Response, Open) => FCall::ROpen {
                fid: decode!(buf),
                error: decode!(buf),
            },
            (Request, OpenFile) => FCall::TOpenFile {
                name: decode!(buf),
                flags: decode!(buf),
                perm: decode!(buf),
            },
            (Response, OpenFile) => FCall::ROpenFile {
                fid: decode!(buf),
                error: decode!(buf),
            },
            (Request, Lstat) => FCall::TLstat { name: decode!(buf) },
            (Response, Lstat) => FCall::RLstat {
                info: decode!(buf),
                error: decode!(buf),
            },
            (Request, Stat) => FCall::TStat { name: decode!(buf) },
            (Response, Stat) => FCall::RStat {
                info: decode!(buf),
                error: decode!(buf),
            },

            /*
             * Open file
             */
            (Request, FileChmod) => FCall::TFileChmod {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            (Response, FileChmod) => FCall::RFileChmod {
                error: decode!(buf),
            },
            (Request, FileClose) => FCall::TFileClose { fid: decode!(buf) },
            (Response, FileClose) => FCall::RFileClose {
                error: decode!(buf),
            },
            (Request, FileRead) => FCall::TFileRead {
                fid: decode!(buf),
                count: decode!(buf),
            },
            (Response, FileRead) => FCall::RFileRead {
                data: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileReadAt) => FCall::TFileReadAt {
                fid: decode!(buf),
                count: decode!(buf),
                offset: decode!(buf),
            },
            (Response, FileReadAt) => FCall::RFileReadAt {
                data: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileReaddir) => FCall::TFileReaddir {
                fid: decode!(buf),
                n: decode!(buf),
            },
            (Response, FileReaddir) => FCall::RFileReaddir {
                entries: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileReaddirnames) => FCall::TFileReaddirnames {
                fid: decode!(buf),
                n: decode!(buf),
            },
            (Response, FileReaddirnames) => FCall::RFileReaddirnames {
                names: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileSeek) => FCall::TFileSeek {
                fid: decode!(buf),
                offset: decode!(buf),
                whence: decode!(buf),
            },
            (Response, FileSeek) => FCall::RFileSeek {
                offset: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileStat) => FCall::TFileStat { fid: decode!(buf) },
            (Response, FileStat) => FCall::RFileStat {
                info: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileSync) => FCall::TFileSync { fid: decode!(buf) },
            (Response, FileSync) => FCall::RFileSync {
                error: decode!(buf),
            },
            (Request, FileTruncate) => FCall::TFileTruncate {
                fid: decode!(buf),
                size: decode!(buf),
            },
            (Response, FileTruncate) => FCall::RFileTruncate {
                error: decode!(buf),
            },
            (Request, FileWrite) => FCall::TFileWrite {
                fid: decode!(buf),
                data: decode!(buf),
            },
            (Response, FileWrite) => FCall::RFileWrite {
                count: decode!(buf),
                error: decode!(buf),
            },
            (Request, FileWriteAt) => FCall::TFileWriteAt {
                fid: decode!(buf),
                data: decode!(buf),
                offset: decode!(buf),
            },
            (Response, FileWriteAt) => FCall::RFileWriteAt {
                count: decode!(buf),
                error: decode!(buf),
            },

            (Response, Close) | (Init, _) => {
                return res!(io_err!(
                    InvalidData,
                    format!("Invalid message: {:?} {:?}", kind, op)
                ));
            }
        };

        Ok(body)
    }
}

/// Helper function to read a frame from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<FCall> {
    Decodable::decode(r)
}

/// Helper function to write a frame into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &FCall) -> Result<usize> {
    msg.encode(w)
}

/// `tokio_util` codec turning a byte stream into `FCall`s and back.
///
/// Frames have no outer length, so decoding is attempted on whatever is
/// buffered; running out of bytes just means the frame is incomplete. A frame
/// cut short inside a length-prefixed field records how much it still needs,
/// and no new attempt is made until that much is buffered.
#[derive(Clone, Copy, Debug, Default)]
pub struct FCallCodec {
    wanted: usize,
}

impl FCallCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl tokio_util::codec::Decoder for FCallCodec {
    type Item = FCall;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> ::std::result::Result<Option<FCall>, Self::Error> {
        if src.is_empty() || src.len() < self.wanted {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        match read_msg(&mut cursor) {
            Ok(msg) => {
                let used = cursor.position() as usize;
                src.advance(used);
                self.wanted = 0;
                Ok(Some(msg))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let missing = missing_bytes(&e);
                self.wanted = src.len() + missing;
                src.reserve(missing);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl tokio_util::codec::Encoder<FCall> for FCallCodec {
    type Error = crate::Error;

    fn encode(&mut self, msg: FCall, dst: &mut BytesMut) -> ::std::result::Result<(), Self::Error> {
        let mut writer = dst.writer();
        write_msg(&mut writer, &msg)?;
        Ok(())
    }
}
