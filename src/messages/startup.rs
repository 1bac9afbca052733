use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Message;
use super::codec;
use crate::error::{ProxyError, ProxyResult};

/// Protocol 3.0, the only version this proxy speaks.
pub const PROTOCOL_VERSION_3_0: (u16, u16) = (3, 0);

/// Postgresql wire protocol startup message.
#[derive(PartialEq, Eq, Debug, new)]
pub struct Startup {
    #[new(value = "3")]
    pub protocol_number_major: u16,
    #[new(value = "0")]
    pub protocol_number_minor: u16,
    #[new(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for Startup {
    fn default() -> Startup {
        Startup::new()
    }
}

impl Startup {
    const MINIMUM_STARTUP_MESSAGE_LEN: usize = 8;
}

impl Message for Startup {
    fn message_length(&self) -> usize {
        let param_length = self
            .parameters
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>();
        // length:4 + protocol_number:4 + params + trailing nullbyte:1
        9 + param_length
    }

    fn max_message_length() -> usize {
        codec::STARTUP_MESSAGE_SIZE_LIMIT
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_u16(self.protocol_number_major);
        buf.put_u16(self.protocol_number_minor);

        for (k, v) in self.parameters.iter() {
            codec::put_cstring(buf, k);
            codec::put_cstring(buf, v);
        }
        // parameter list ends with a single \0
        codec::put_cstring(buf, "");

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, msg_len: usize) -> ProxyResult<Self> {
        if msg_len <= Self::MINIMUM_STARTUP_MESSAGE_LEN {
            return Err(ProxyError::InvalidStartupMessage);
        }

        let protocol_number_major = buf.get_u16();
        let protocol_number_minor = buf.get_u16();

        let mut parameters = BTreeMap::new();
        while let Some(key) = codec::get_cstring(buf) {
            let value = codec::get_cstring(buf).unwrap_or_default();
            parameters.insert(key, value);
        }

        Ok(Startup {
            protocol_number_major,
            protocol_number_minor,
            parameters,
        })
    }
}

/// Authentication response family, sent by the server side of a connection.
/// The proxy both emits these to clients and decodes them from backends.
#[derive(PartialEq, Eq, Debug)]
pub enum Authentication {
    Ok,                   // code 0
    CleartextPassword,    // code 3
    MD5Password([u8; 4]), // code 5, with 4 bytes of md5 salt
    SASL(Vec<String>),    // code 10, with supported sasl mechanisms
    SASLContinue(Bytes),  // code 11, with authentication data
    SASLFinal(Bytes),     // code 12, with additional authentication data
}

pub const MESSAGE_TYPE_BYTE_AUTHENTICATION: u8 = b'R';

impl Message for Authentication {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_AUTHENTICATION)
    }

    fn message_length(&self) -> usize {
        match self {
            Authentication::Ok | Authentication::CleartextPassword => 8,
            Authentication::MD5Password(_) => 12,
            Authentication::SASL(methods) => {
                8 + methods.iter().map(|v| v.len() + 1).sum::<usize>() + 1
            }
            Authentication::SASLContinue(data) | Authentication::SASLFinal(data) => 8 + data.len(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            Authentication::Ok => buf.put_i32(0),
            Authentication::CleartextPassword => buf.put_i32(3),
            Authentication::MD5Password(salt) => {
                buf.put_i32(5);
                buf.put_slice(salt.as_ref());
            }
            Authentication::SASL(methods) => {
                buf.put_i32(10);
                for method in methods {
                    codec::put_cstring(buf, method);
                }
                buf.put_u8(b'\0');
            }
            Authentication::SASLContinue(data) => {
                buf.put_i32(11);
                buf.put_slice(data.as_ref());
            }
            Authentication::SASLFinal(data) => {
                buf.put_i32(12);
                buf.put_slice(data.as_ref());
            }
        }
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, msg_len: usize) -> ProxyResult<Self> {
        let code = buf.get_i32();
        let msg = match code {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                buf.copy_to_slice(&mut salt);
                Authentication::MD5Password(salt)
            }
            10 => {
                let mut methods = Vec::new();
                while let Some(method) = codec::get_cstring(buf) {
                    methods.push(method);
                }
                Authentication::SASL(methods)
            }
            11 => Authentication::SASLContinue(buf.split_to(msg_len - 8).freeze()),
            12 => Authentication::SASLFinal(buf.split_to(msg_len - 8).freeze()),
            _ => {
                return Err(ProxyError::BackendProtocol("authentication"));
            }
        };

        Ok(msg)
    }
}

pub const MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY: u8 = b'p';

/// Several frontend messages share the type byte `p` and can only be told
/// apart by authentication state:
///
/// * `Password`
/// * `SASLInitialResponse`
/// * `SASLResponse`
///
/// They are decoded into this family as raw bytes; the authenticator calls
/// `into_password`/`into_sasl_initial_response`/`into_sasl_response` once it
/// knows which one to expect.
#[derive(Debug)]
pub enum PasswordMessageFamily {
    Raw(BytesMut),
    Password(Password),
    SASLInitialResponse(SASLInitialResponse),
    SASLResponse(SASLResponse),
}

impl Message for PasswordMessageFamily {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        match self {
            PasswordMessageFamily::Raw(body) => body.len() + 4,
            PasswordMessageFamily::Password(inner) => inner.message_length(),
            PasswordMessageFamily::SASLInitialResponse(inner) => inner.message_length(),
            PasswordMessageFamily::SASLResponse(inner) => inner.message_length(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            PasswordMessageFamily::Raw(body) => {
                buf.put_slice(body.as_ref());
                Ok(())
            }
            PasswordMessageFamily::Password(inner) => inner.encode_body(buf),
            PasswordMessageFamily::SASLInitialResponse(inner) => inner.encode_body(buf),
            PasswordMessageFamily::SASLResponse(inner) => inner.encode_body(buf),
        }
    }

    fn decode_body(buf: &mut BytesMut, full_len: usize) -> ProxyResult<Self> {
        let body = buf.split_to(full_len - 4);
        Ok(PasswordMessageFamily::Raw(body))
    }
}

impl PasswordMessageFamily {
    pub fn into_password(self) -> ProxyResult<Password> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            Password::decode_body(&mut body, len)
        } else {
            Err(ProxyError::InvalidScramMessage(
                "password message already coerced".to_owned(),
            ))
        }
    }

    pub fn into_sasl_initial_response(self) -> ProxyResult<SASLInitialResponse> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            SASLInitialResponse::decode_body(&mut body, len)
        } else {
            Err(ProxyError::InvalidScramMessage(
                "password message already coerced".to_owned(),
            ))
        }
    }

    pub fn into_sasl_response(self) -> ProxyResult<SASLResponse> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            SASLResponse::decode_body(&mut body, len)
        } else {
            Err(ProxyError::InvalidScramMessage(
                "password message already coerced".to_owned(),
            ))
        }
    }
}

/// Cleartext or md5-hashed password, sent by a frontend.
#[derive(PartialEq, Eq, Debug, new)]
pub struct Password {
    pub password: String,
}

impl Message for Password {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        5 + self.password.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.password);

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let pass = codec::get_cstring(buf).unwrap_or_default();

        Ok(Password::new(pass))
    }
}

#[derive(PartialEq, Eq, Debug, new)]
pub struct SASLInitialResponse {
    pub auth_method: String,
    pub data: Option<Bytes>,
}

impl Message for SASLInitialResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        4 + self.auth_method.len() + 1 + 4 + self.data.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.auth_method);
        if let Some(ref data) = self.data {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data.as_ref());
        } else {
            buf.put_i32(-1);
        }
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _full_len: usize) -> ProxyResult<Self> {
        let auth_method = codec::get_cstring(buf).unwrap_or_default();
        let data_len = buf.get_i32();
        let data = if data_len == -1 {
            None
        } else {
            Some(buf.split_to(data_len as usize).freeze())
        };

        Ok(SASLInitialResponse { auth_method, data })
    }
}

#[derive(PartialEq, Eq, Debug, new)]
pub struct SASLResponse {
    pub data: Bytes,
}

impl Message for SASLResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        4 + self.data.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_slice(self.data.as_ref());
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, full_len: usize) -> ProxyResult<Self> {
        let data = buf.split_to(full_len - 4).freeze();
        Ok(SASLResponse { data })
    }
}

/// Parameter report sent by the server after authentication succeeds.
#[derive(PartialEq, Eq, Debug, new)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

pub const MESSAGE_TYPE_BYTE_PARAMETER_STATUS: u8 = b'S';

impl Message for ParameterStatus {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PARAMETER_STATUS)
    }

    fn message_length(&self) -> usize {
        4 + 2 + self.name.len() + self.value.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.name);
        codec::put_cstring(buf, &self.value);

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let name = codec::get_cstring(buf).unwrap_or_default();
        let value = codec::get_cstring(buf).unwrap_or_default();

        Ok(ParameterStatus::new(name, value))
    }
}

/// `BackendKeyData`, the pid/secret pair a server hands out for cancel
/// requests.
#[derive(PartialEq, Eq, Debug, new)]
pub struct BackendKeyData {
    pub pid: i32,
    pub secret_key: i32,
}

pub const MESSAGE_TYPE_BYTE_BACKEND_KEY_DATA: u8 = b'K';

impl Message for BackendKeyData {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_BACKEND_KEY_DATA)
    }

    #[inline]
    fn message_length(&self) -> usize {
        12
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i32(self.pid);
        buf.put_i32(self.secret_key);

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let pid = buf.get_i32();
        let secret_key = buf.get_i32();

        Ok(BackendKeyData { pid, secret_key })
    }
}

/// `SslRequest` is sent before startup to probe for TLS support. The packet
/// has no type byte, only a length and a magic number; the reply is the
/// single byte `S` or `N`.
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct SslRequest;

impl SslRequest {
    pub const BODY_MAGIC_NUMBER: i32 = 80877103;
    pub const BODY_SIZE: usize = 8;

    pub fn is_ssl_request_packet(buf: &[u8]) -> bool {
        buf.remaining() >= Self::BODY_SIZE && (&buf[4..8]).get_i32() == Self::BODY_MAGIC_NUMBER
    }
}

impl Message for SslRequest {
    #[inline]
    fn message_length(&self) -> usize {
        Self::BODY_SIZE
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i32(Self::BODY_MAGIC_NUMBER);
        Ok(())
    }

    fn decode_body(_buf: &mut BytesMut, _full_len: usize) -> ProxyResult<Self> {
        Err(ProxyError::InvalidStartupMessage)
    }

    /// Check `is_ssl_request_packet` first unless an error for other packet
    /// types is acceptable.
    fn decode(buf: &mut BytesMut) -> ProxyResult<Option<Self>> {
        if buf.remaining() >= Self::BODY_SIZE {
            if Self::is_ssl_request_packet(buf) {
                buf.advance(Self::BODY_SIZE);
                Ok(Some(SslRequest))
            } else {
                Err(ProxyError::InvalidStartupMessage)
            }
        } else {
            Ok(None)
        }
    }
}

/// `CancelRequest` arrives on a dedicated connection in place of a startup
/// packet. This proxy does not honor cancellation; detection is still
/// required so the connection can be closed cleanly.
#[derive(PartialEq, Eq, Debug, new)]
pub struct CancelRequest {
    pub pid: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub const BODY_MAGIC_NUMBER: i32 = 80877102;
    pub const BODY_SIZE: usize = 16;

    pub fn is_cancel_request_packet(buf: &[u8]) -> bool {
        buf.remaining() >= 8 && (&buf[4..8]).get_i32() == Self::BODY_MAGIC_NUMBER
    }
}

impl Message for CancelRequest {
    #[inline]
    fn message_length(&self) -> usize {
        Self::BODY_SIZE
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i32(Self::BODY_MAGIC_NUMBER);
        buf.put_i32(self.pid);
        buf.put_i32(self.secret_key);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _full_len: usize) -> ProxyResult<Self> {
        let magic = buf.get_i32();
        if magic != Self::BODY_MAGIC_NUMBER {
            return Err(ProxyError::InvalidStartupMessage);
        }
        let pid = buf.get_i32();
        let secret_key = buf.get_i32();
        Ok(CancelRequest { pid, secret_key })
    }
}
