use bytes::BytesMut;

use super::Message;
use super::codec;
use crate::error::ProxyResult;

/// Simple query, a single message carrying the whole SQL text.
#[derive(PartialEq, Eq, Debug, new)]
pub struct Query {
    pub query: String,
}

pub const MESSAGE_TYPE_BYTE_QUERY: u8 = b'Q';

impl Message for Query {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_QUERY)
    }

    fn message_length(&self) -> usize {
        5 + self.query.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.query);

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let query = codec::get_cstring(buf).unwrap_or_default();

        Ok(Query::new(query))
    }
}
