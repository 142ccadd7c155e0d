//! # codec：请求/响应编解码契约与参考帧格式
//!
//! ## 意图（Why）
//! - 连接层只关心“带标识写出请求”与“从字节流中取出 `(标识, 响应)`”，消息本身对其不透明；
//! - [`Codec`] 把这两个动作抽象出来，同时提供心跳与启动握手所需的请求。
//!
//! ## 契约（What）
//! - `encode` 把请求连同流标识追加到 `dst`；
//! - `decode` 从 `src` 头部取出一个完整响应帧，数据不足时返回 `Ok(None)` 且不消费任何字节；
//!   返回 `Err` 表示字节流不可恢复，连接随即关闭；
//! - 服务端针对单个请求的错误体现为 [`ResponseFrame::body`] 中的 [`ServerError`]，不会关闭连接。
//!
//! ## 参考实现（How）
//! - [`BinaryFrameCodec`] 使用 9 字节帧头：`[version u8][flags u8][stream u16 BE][opcode u8][length u32 BE]`，
//!   响应帧的版本字节最高位为 1；
//! - `ERROR` 帧的消息体为 `[code u32 BE][utf8 message]`；
//! - 消息体超过 [`MAX_FRAME_BODY`] 视为编解码错误。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::ProtocolVersion;
use crate::error::{CodecError, ServerError};
use crate::stream_id::StreamId;

/// 解码出的单个响应帧。
#[derive(Debug)]
pub struct ResponseFrame<R> {
    pub stream: StreamId,
    pub body: Result<R, ServerError>,
}

/// 连接层依赖的编解码契约。
pub trait Codec: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + 'static;

    /// 以 `stream` 为标识编码请求。
    fn encode(
        &self,
        request: &Self::Request,
        stream: StreamId,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError>;

    /// 尝试从缓冲区头部解码一个响应帧。
    fn decode(&self, src: &mut BytesMut) -> Result<Option<ResponseFrame<Self::Response>>, CodecError>;

    /// 空闲保活使用的无副作用请求。
    fn heartbeat(&self) -> Self::Request;

    /// 连接建立后、进入 `Ready` 之前需要完成的握手请求。
    fn startup(&self) -> Option<Self::Request> {
        None
    }
}

pub const HEADER_LEN: usize = 9;
pub const MAX_FRAME_BODY: usize = 256 * 1024 * 1024;
const RESPONSE_FLAG: u8 = 0x80;

/// 参考帧格式中的操作码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
}

impl Opcode {
    pub fn from_byte(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            other => return Err(CodecError::UnknownOpcode(other)),
        })
    }
}

/// 参考帧格式的完整帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub flags: u8,
    pub stream: StreamId,
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Frame {
    pub fn request(version: ProtocolVersion, stream: StreamId, opcode: Opcode, body: Bytes) -> Self {
        Self {
            version: version.as_byte(),
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    pub fn response(version: ProtocolVersion, stream: StreamId, opcode: Opcode, body: Bytes) -> Self {
        Self {
            version: version.as_byte() | RESPONSE_FLAG,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    /// 构造携带错误码与文案的 `ERROR` 响应帧。
    pub fn error(version: ProtocolVersion, stream: StreamId, code: u32, message: &str) -> Self {
        let mut body = BytesMut::with_capacity(4 + message.len());
        body.put_u32(code);
        body.put_slice(message.as_bytes());
        Self::response(version, stream, Opcode::Error, body.freeze())
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_FLAG != 0
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = self.body.len();
        if length > MAX_FRAME_BODY {
            return Err(CodecError::FrameTooLarge {
                length,
                limit: MAX_FRAME_BODY,
            });
        }
        dst.reserve(HEADER_LEN + length);
        dst.put_u8(self.version);
        dst.put_u8(self.flags);
        dst.put_u16(self.stream.get());
        dst.put_u8(self.opcode as u8);
        dst.put_u32(length as u32);
        dst.put_slice(&self.body);
        Ok(())
    }

    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if length > MAX_FRAME_BODY {
            return Err(CodecError::FrameTooLarge {
                length,
                limit: MAX_FRAME_BODY,
            });
        }
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }
        let opcode = Opcode::from_byte(src[4])?;
        let mut header = src.split_to(HEADER_LEN);
        let version = header.get_u8();
        let flags = header.get_u8();
        let stream = StreamId::new(header.get_u16());
        let body = src.split_to(length).freeze();
        Ok(Some(Self {
            version,
            flags,
            stream,
            opcode,
            body,
        }))
    }
}

/// 参考编解码器的消息：操作码加不透明消息体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            body: body.into(),
        }
    }

    pub fn query(body: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Query, body)
    }

    pub fn options() -> Self {
        Self::new(Opcode::Options, Bytes::new())
    }

    pub fn startup() -> Self {
        Self::new(Opcode::Startup, Bytes::new())
    }
}

/// 基于 [`Frame`] 的参考编解码器。
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryFrameCodec {
    version: ProtocolVersion,
    handshake: bool,
}

impl BinaryFrameCodec {
    pub const fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            handshake: false,
        }
    }

    /// 启用 `STARTUP` 握手：连接在收到 `READY` 之前不会对外可用。
    pub const fn with_handshake(mut self) -> Self {
        self.handshake = true;
        self
    }

    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }
}

impl Codec for BinaryFrameCodec {
    type Request = Message;
    type Response = Message;

    fn encode(&self, request: &Message, stream: StreamId, dst: &mut BytesMut) -> Result<(), CodecError> {
        Frame::request(self.version, stream, request.opcode, request.body.clone()).encode(dst)
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<ResponseFrame<Message>>, CodecError> {
        let Some(frame) = Frame::decode(src)? else {
            return Ok(None);
        };
        if !frame.is_response() {
            return Err(CodecError::Malformed(format!(
                "expected a response frame on stream {}",
                frame.stream
            )));
        }
        let body = match frame.opcode {
            Opcode::Error => Err(decode_server_error(frame.body)?),
            opcode => Ok(Message {
                opcode,
                body: frame.body,
            }),
        };
        Ok(Some(ResponseFrame {
            stream: frame.stream,
            body,
        }))
    }

    fn heartbeat(&self) -> Message {
        Message::options()
    }

    fn startup(&self) -> Option<Message> {
        self.handshake.then(Message::startup)
    }
}

fn decode_server_error(mut body: Bytes) -> Result<ServerError, CodecError> {
    if body.len() < 4 {
        return Err(CodecError::Malformed("error body shorter than 4 bytes".into()));
    }
    let code = body.get_u32();
    let message = String::from_utf8(body.to_vec())
        .map_err(|_| CodecError::Malformed("error message is not utf-8".into()))?;
    Ok(ServerError { code, message })
}
