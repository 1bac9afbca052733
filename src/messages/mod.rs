//! Postgresql wire protocol message definitions and codecs.
//!
//! `FrontendMessage` covers everything the proxy accepts from clients and
//! sends to backends; `BackendMessage` covers everything the proxy sends to
//! clients and reads from backends. The `Message` trait encodes/decodes a
//! single message on a `BytesMut` buffer.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProxyError, ProxyResult};

/// Postgres object id.
pub type Oid = u32;

mod codec;
/// Row data and descriptions
pub mod data;
/// Extended query messages: parse, bind, describe, execute and friends
pub mod extendedquery;
/// General response messages
pub mod response;
/// Simple query message
pub mod simplequery;
/// Startup, authentication and negotiation messages
pub mod startup;
/// Termination message
pub mod terminate;

/// Defines how a message is encoded and decoded.
pub trait Message: Sized {
    /// Return the type code of the message. The startup family carries no
    /// type byte and returns `None`.
    #[inline]
    fn message_type() -> Option<u8> {
        None
    }

    /// Return the length of the message, including the length integer
    /// itself but not the type byte.
    fn message_length(&self) -> usize;

    /// Largest acceptable wire size when decoding this message type.
    fn max_message_length() -> usize {
        codec::DEFAULT_MESSAGE_SIZE_LIMIT
    }

    /// Encode the body, everything after the length integer.
    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()>;

    /// Decode the body. `buf` holds exactly the body bytes; `msg_len` is the
    /// full message length from the wire.
    fn decode_body(buf: &mut BytesMut, msg_len: usize) -> ProxyResult<Self>;

    /// Encode the message with its type byte and length header.
    fn encode(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        if let Some(mt) = Self::message_type() {
            buf.put_u8(mt);
        }

        buf.put_i32(self.message_length() as i32);
        self.encode_body(buf)
    }

    /// Decode one message, returning `None` while the packet is incomplete.
    fn decode(buf: &mut BytesMut) -> ProxyResult<Option<Self>> {
        let offset = Self::message_type().is_some().into();

        codec::decode_packet(buf, offset, Self::max_message_length(), |buf, full_len| {
            Self::decode_body(buf, full_len)
        })
    }
}

/// Messages read from a frontend (and written to backends).
#[derive(Debug)]
pub enum FrontendMessage {
    Startup(startup::Startup),
    CancelRequest(startup::CancelRequest),
    SslRequest(startup::SslRequest),
    PasswordMessageFamily(startup::PasswordMessageFamily),

    Query(simplequery::Query),

    Parse(extendedquery::Parse),
    Bind(extendedquery::Bind),
    Close(extendedquery::Close),
    Describe(extendedquery::Describe),
    Execute(extendedquery::Execute),
    Flush(extendedquery::Flush),
    Sync(extendedquery::Sync),

    Terminate(terminate::Terminate),
}

impl FrontendMessage {
    pub fn is_extended_query(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::Bind(_)
                | Self::Close(_)
                | Self::Describe(_)
                | Self::Execute(_)
                | Self::Flush(_)
                | Self::Sync(_)
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            Self::Startup(msg) => msg.encode(buf),
            Self::CancelRequest(msg) => msg.encode(buf),
            Self::SslRequest(msg) => msg.encode(buf),

            Self::PasswordMessageFamily(msg) => msg.encode(buf),

            Self::Query(msg) => msg.encode(buf),

            Self::Parse(msg) => msg.encode(buf),
            Self::Bind(msg) => msg.encode(buf),
            Self::Close(msg) => msg.encode(buf),
            Self::Describe(msg) => msg.encode(buf),
            Self::Execute(msg) => msg.encode(buf),
            Self::Flush(msg) => msg.encode(buf),
            Self::Sync(msg) => msg.encode(buf),

            Self::Terminate(msg) => msg.encode(buf),
        }
    }

    /// Decode the next frontend message. Before the startup packet is seen
    /// the wire carries untyped packets (`Startup` or `CancelRequest`,
    /// distinguished by magic number); afterwards every message has a type
    /// byte.
    pub fn decode(buf: &mut BytesMut, awaiting_startup: bool) -> ProxyResult<Option<Self>> {
        if awaiting_startup {
            // untyped packets carry at least length + magic
            if buf.remaining() >= 8 {
                if startup::CancelRequest::is_cancel_request_packet(buf) {
                    startup::CancelRequest::decode(buf).map(|v| v.map(Self::CancelRequest))
                } else {
                    startup::Startup::decode(buf).map(|v| v.map(Self::Startup))
                }
            } else {
                Ok(None)
            }
        } else if buf.remaining() > 1 {
            let first_byte = buf[0];

            match first_byte {
                // Password, SASLInitialResponse and SASLResponse share a
                // type byte and are resolved later by the authenticator.
                startup::MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY => {
                    startup::PasswordMessageFamily::decode(buf)
                        .map(|v| v.map(Self::PasswordMessageFamily))
                }

                simplequery::MESSAGE_TYPE_BYTE_QUERY => {
                    simplequery::Query::decode(buf).map(|v| v.map(Self::Query))
                }

                extendedquery::MESSAGE_TYPE_BYTE_PARSE => {
                    extendedquery::Parse::decode(buf).map(|v| v.map(Self::Parse))
                }
                extendedquery::MESSAGE_TYPE_BYTE_BIND => {
                    extendedquery::Bind::decode(buf).map(|v| v.map(Self::Bind))
                }
                extendedquery::MESSAGE_TYPE_BYTE_CLOSE => {
                    extendedquery::Close::decode(buf).map(|v| v.map(Self::Close))
                }
                extendedquery::MESSAGE_TYPE_BYTE_DESCRIBE => {
                    extendedquery::Describe::decode(buf).map(|v| v.map(Self::Describe))
                }
                extendedquery::MESSAGE_TYPE_BYTE_EXECUTE => {
                    extendedquery::Execute::decode(buf).map(|v| v.map(Self::Execute))
                }
                extendedquery::MESSAGE_TYPE_BYTE_FLUSH => {
                    extendedquery::Flush::decode(buf).map(|v| v.map(Self::Flush))
                }
                extendedquery::MESSAGE_TYPE_BYTE_SYNC => {
                    extendedquery::Sync::decode(buf).map(|v| v.map(Self::Sync))
                }

                terminate::MESSAGE_TYPE_BYTE_TERMINATE => {
                    terminate::Terminate::decode(buf).map(|v| v.map(Self::Terminate))
                }

                _ => Err(ProxyError::InvalidMessageType(first_byte)),
            }
        } else {
            Ok(None)
        }
    }
}

/// Messages written to a frontend (and read from backends).
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(startup::Authentication),
    ParameterStatus(startup::ParameterStatus),
    BackendKeyData(startup::BackendKeyData),

    ParseComplete(extendedquery::ParseComplete),
    BindComplete(extendedquery::BindComplete),
    CloseComplete(extendedquery::CloseComplete),
    PortalSuspended(extendedquery::PortalSuspended),

    CommandComplete(response::CommandComplete),
    EmptyQueryResponse(response::EmptyQueryResponse),
    ReadyForQuery(response::ReadyForQuery),
    ErrorResponse(response::ErrorResponse),
    NoticeResponse(response::NoticeResponse),
    SslResponse(response::SslResponse),

    ParameterDescription(data::ParameterDescription),
    RowDescription(data::RowDescription),
    DataRow(data::DataRow),
    NoData(data::NoData),
}

impl BackendMessage {
    pub fn encode(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            Self::Authentication(msg) => msg.encode(buf),
            Self::ParameterStatus(msg) => msg.encode(buf),
            Self::BackendKeyData(msg) => msg.encode(buf),

            Self::ParseComplete(msg) => msg.encode(buf),
            Self::BindComplete(msg) => msg.encode(buf),
            Self::CloseComplete(msg) => msg.encode(buf),
            Self::PortalSuspended(msg) => msg.encode(buf),

            Self::CommandComplete(msg) => msg.encode(buf),
            Self::EmptyQueryResponse(msg) => msg.encode(buf),
            Self::ReadyForQuery(msg) => msg.encode(buf),
            Self::ErrorResponse(msg) => msg.encode(buf),
            Self::NoticeResponse(msg) => msg.encode(buf),
            Self::SslResponse(msg) => msg.encode(buf),

            Self::ParameterDescription(msg) => msg.encode(buf),
            Self::RowDescription(msg) => msg.encode(buf),
            Self::DataRow(msg) => msg.encode(buf),
            Self::NoData(msg) => msg.encode(buf),
        }
    }

    pub fn decode(buf: &mut BytesMut) -> ProxyResult<Option<Self>> {
        if buf.remaining() > 1 {
            let first_byte = buf[0];
            match first_byte {
                startup::MESSAGE_TYPE_BYTE_AUTHENTICATION => {
                    startup::Authentication::decode(buf).map(|v| v.map(Self::Authentication))
                }
                startup::MESSAGE_TYPE_BYTE_PARAMETER_STATUS => {
                    startup::ParameterStatus::decode(buf).map(|v| v.map(Self::ParameterStatus))
                }
                startup::MESSAGE_TYPE_BYTE_BACKEND_KEY_DATA => {
                    startup::BackendKeyData::decode(buf).map(|v| v.map(Self::BackendKeyData))
                }

                extendedquery::MESSAGE_TYPE_BYTE_PARSE_COMPLETE => {
                    extendedquery::ParseComplete::decode(buf).map(|v| v.map(Self::ParseComplete))
                }
                extendedquery::MESSAGE_TYPE_BYTE_BIND_COMPLETE => {
                    extendedquery::BindComplete::decode(buf).map(|v| v.map(Self::BindComplete))
                }
                extendedquery::MESSAGE_TYPE_BYTE_CLOSE_COMPLETE => {
                    extendedquery::CloseComplete::decode(buf).map(|v| v.map(Self::CloseComplete))
                }
                extendedquery::MESSAGE_TYPE_BYTE_PORTAL_SUSPENDED => {
                    extendedquery::PortalSuspended::decode(buf).map(|v| v.map(Self::PortalSuspended))
                }

                response::MESSAGE_TYPE_BYTE_COMMAND_COMPLETE => {
                    response::CommandComplete::decode(buf).map(|v| v.map(Self::CommandComplete))
                }
                response::MESSAGE_TYPE_BYTE_EMPTY_QUERY_RESPONSE => {
                    response::EmptyQueryResponse::decode(buf).map(|v| v.map(Self::EmptyQueryResponse))
                }
                response::MESSAGE_TYPE_BYTE_READY_FOR_QUERY => {
                    response::ReadyForQuery::decode(buf).map(|v| v.map(Self::ReadyForQuery))
                }
                response::MESSAGE_TYPE_BYTE_ERROR_RESPONSE => {
                    response::ErrorResponse::decode(buf).map(|v| v.map(Self::ErrorResponse))
                }
                response::MESSAGE_TYPE_BYTE_NOTICE_RESPONSE => {
                    response::NoticeResponse::decode(buf).map(|v| v.map(Self::NoticeResponse))
                }

                data::MESSAGE_TYPE_BYTE_PARAMETER_DESCRIPTION => {
                    data::ParameterDescription::decode(buf)
                        .map(|v| v.map(Self::ParameterDescription))
                }
                data::MESSAGE_TYPE_BYTE_ROW_DESCRIPTION => {
                    data::RowDescription::decode(buf).map(|v| v.map(Self::RowDescription))
                }
                data::MESSAGE_TYPE_BYTE_DATA_ROW => {
                    data::DataRow::decode(buf).map(|v| v.map(Self::DataRow))
                }
                data::MESSAGE_TYPE_BYTE_NO_DATA => {
                    data::NoData::decode(buf).map(|v| v.map(Self::NoData))
                }

                _ => Err(ProxyError::InvalidMessageType(first_byte)),
            }
        } else {
            Ok(None)
        }
    }
}
