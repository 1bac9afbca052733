use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Message, Oid, codec};
use crate::error::ProxyResult;

pub const FORMAT_CODE_TEXT: i16 = 0;
pub const FORMAT_CODE_BINARY: i16 = 1;

/// One column of a `RowDescription`.
#[derive(PartialEq, Eq, Debug, Default, Clone, new)]
pub struct FieldDescription {
    // the field name
    pub name: String,
    // the object ID of the source table, 0 if not a table column
    pub table_id: i32,
    // the attribute number of the source column, 0 if not a table column
    pub column_id: i16,
    // the object ID of the data type
    pub type_id: Oid,
    // the size of the data type, negative for variable-width types
    pub type_size: i16,
    // the type modifier
    pub type_modifier: i32,
    // 0 for text, 1 for binary
    pub format_code: i16,
}

#[derive(PartialEq, Eq, Debug, Default, Clone, new)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

pub const MESSAGE_TYPE_BYTE_ROW_DESCRIPTION: u8 = b'T';

impl Message for RowDescription {
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_ROW_DESCRIPTION)
    }

    fn message_length(&self) -> usize {
        4 + 2
            + self
                .fields
                .iter()
                .map(|f| f.name.len() + 1 + 4 + 2 + 4 + 2 + 4 + 2)
                .sum::<usize>()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i16(self.fields.len() as i16);

        for field in &self.fields {
            codec::put_cstring(buf, &field.name);
            buf.put_i32(field.table_id);
            buf.put_i16(field.column_id);
            buf.put_u32(field.type_id);
            buf.put_i16(field.type_size);
            buf.put_i32(field.type_modifier);
            buf.put_i16(field.format_code);
        }

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let fields_len = buf.get_i16();
        let mut fields = Vec::with_capacity(fields_len as usize);

        for _ in 0..fields_len {
            let field = FieldDescription {
                name: codec::get_cstring(buf).unwrap_or_default(),
                table_id: buf.get_i32(),
                column_id: buf.get_i16(),
                type_id: buf.get_u32(),
                type_size: buf.get_i16(),
                type_modifier: buf.get_i32(),
                format_code: buf.get_i16(),
            };

            fields.push(field);
        }

        Ok(RowDescription { fields })
    }
}

/// A single result row. Fields are raw wire bytes in whatever format the
/// matching `RowDescription` declared; `None` is NULL (length -1 on the
/// wire).
#[derive(PartialEq, Eq, Debug, Default, Clone, new)]
pub struct DataRow {
    pub fields: Vec<Option<Bytes>>,
}

pub const MESSAGE_TYPE_BYTE_DATA_ROW: u8 = b'D';

impl Message for DataRow {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_DATA_ROW)
    }

    fn message_length(&self) -> usize {
        4 + 2
            + self
                .fields
                .iter()
                .map(|b| 4 + b.as_ref().map(|b| b.len()).unwrap_or(0))
                .sum::<usize>()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i16(self.fields.len() as i16);
        for field in &self.fields {
            if let Some(bytes) = field {
                buf.put_i32(bytes.len() as i32);
                buf.put_slice(bytes.as_ref());
            } else {
                buf.put_i32(-1);
            }
        }

        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _msg_len: usize) -> ProxyResult<Self> {
        let field_count = buf.get_i16() as usize;

        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field_len = buf.get_i32();
            if field_len >= 0 {
                fields.push(Some(buf.split_to(field_len as usize).freeze()));
            } else {
                fields.push(None);
            }
        }

        Ok(DataRow { fields })
    }
}

/// Statement or portal produces no rows.
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct NoData;

pub const MESSAGE_TYPE_BYTE_NO_DATA: u8 = b'n';

impl Message for NoData {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_NO_DATA)
    }

    #[inline]
    fn message_length(&self) -> usize {
        4
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> ProxyResult<()> {
        Ok(())
    }

    fn decode_body(_buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        Ok(NoData)
    }
}

/// Declared parameter types of a described statement.
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct ParameterDescription {
    pub types: Vec<Oid>,
}

pub const MESSAGE_TYPE_BYTE_PARAMETER_DESCRIPTION: u8 = b't';

impl Message for ParameterDescription {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PARAMETER_DESCRIPTION)
    }

    fn message_length(&self) -> usize {
        4 + 2 + 4 * self.types.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i16(self.types.len() as i16);
        for oid in &self.types {
            buf.put_u32(*oid);
        }
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let count = buf.get_i16();
        let mut types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            types.push(buf.get_u32());
        }
        Ok(ParameterDescription { types })
    }
}
