//! Response packets sent back to clients
use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWrite;

use super::handshake::DEFAULT_CHARSET;
use super::{put_lenenc_bytes, put_lenenc_int, PacketWriter};
use crate::backend::{ColumnInfo, ColumnType, QueryOutcome};
use crate::error::RutaResult;

/// `binary` collation, used for numeric columns
const BINARY_CHARSET: u16 = 63;

const UNSIGNED_FLAG: u16 = 0x0020;
const BINARY_FLAG: u16 = 0x0080;
const NUM_FLAG: u16 = 0x8000;

pub fn ok_packet(affected_rows: u64, last_insert_id: u64, status: u16, info: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + info.len());
    buf.put_u8(0x00);
    put_lenenc_int(&mut buf, affected_rows);
    put_lenenc_int(&mut buf, last_insert_id);
    buf.put_u16_le(status);
    buf.put_u16_le(0);
    buf.extend_from_slice(info.as_bytes());
    buf
}

pub fn err_packet(code: u16, sql_state: &str, message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(9 + message.len());
    buf.put_u8(0xFF);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    let mut state = [b'0'; 5];
    for (slot, byte) in state.iter_mut().zip(sql_state.bytes()) {
        *slot = byte;
    }
    buf.extend_from_slice(&state);
    buf.extend_from_slice(message.as_bytes());
    buf
}

pub fn eof_packet(status: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(0xFE);
    buf.put_u16_le(0);
    buf.put_u16_le(status);
    buf
}

pub fn column_definition(column: &ColumnInfo) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 + column.name.len() * 2);
    put_lenenc_bytes(&mut buf, b"def");
    put_lenenc_bytes(&mut buf, b"");
    put_lenenc_bytes(&mut buf, b"");
    put_lenenc_bytes(&mut buf, b"");
    put_lenenc_bytes(&mut buf, column.name.as_bytes());
    put_lenenc_bytes(&mut buf, column.name.as_bytes());
    put_lenenc_int(&mut buf, 0x0c);

    let numeric = column.column_type.is_numeric();
    let charset = if numeric {
        BINARY_CHARSET
    } else {
        u16::from(DEFAULT_CHARSET)
    };
    let mut flags = 0;
    if numeric {
        flags |= BINARY_FLAG | NUM_FLAG;
    }
    if column.unsigned {
        flags |= UNSIGNED_FLAG;
    }

    buf.put_u16_le(charset);
    buf.put_u32_le(display_length(column.column_type));
    buf.put_u8(column.column_type.code());
    buf.put_u16_le(flags);
    buf.put_u8(decimals(column.column_type));
    buf.put_u16_le(0);
    buf
}

fn display_length(column_type: ColumnType) -> u32 {
    match column_type {
        ColumnType::Tiny => 4,
        ColumnType::Short => 6,
        ColumnType::Int24 => 9,
        ColumnType::Long => 11,
        ColumnType::LongLong => 20,
        ColumnType::Year => 4,
        ColumnType::Float => 12,
        ColumnType::Double => 22,
        ColumnType::Decimal | ColumnType::NewDecimal => 65,
        ColumnType::Date => 10,
        ColumnType::Time => 10,
        ColumnType::DateTime | ColumnType::Timestamp => 19,
        ColumnType::Blob | ColumnType::Json | ColumnType::Geometry => 0xFFFF_FFFF,
        _ => 1024,
    }
}

fn decimals(column_type: ColumnType) -> u8 {
    match column_type {
        ColumnType::Float
        | ColumnType::Double
        | ColumnType::VarString
        | ColumnType::VarChar
        | ColumnType::String
        | ColumnType::Blob
        | ColumnType::Json => 0x1f,
        _ => 0,
    }
}

/// Text resultset: column count, definitions, EOF, rows, EOF
pub fn write_result_set<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    columns: &[ColumnInfo],
    rows: &[Vec<Option<bytes::Bytes>>],
    status: u16,
) {
    let mut count = BytesMut::with_capacity(9);
    put_lenenc_int(&mut count, columns.len() as u64);
    writer.write_packet(&count);
    for column in columns {
        writer.write_packet(&column_definition(column));
    }
    writer.write_packet(&eof_packet(status));

    let mut row_buf = BytesMut::new();
    for row in rows {
        row_buf.clear();
        for value in row {
            match value {
                Some(value) => put_lenenc_bytes(&mut row_buf, value),
                None => row_buf.put_u8(0xFB),
            }
        }
        writer.write_packet(&row_buf);
    }
    writer.write_packet(&eof_packet(status));
}

/// Encode a statement's result and flush it to the client
pub async fn write_outcome<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    outcome: &QueryOutcome,
    status: u16,
) -> RutaResult<()> {
    match outcome {
        QueryOutcome::ResultSet { columns, rows } => {
            write_result_set(writer, columns, rows, status);
        }
        QueryOutcome::Modified {
            affected_rows,
            last_insert_id,
        } => writer.write_packet(&ok_packet(*affected_rows, *last_insert_id, status, "")),
    }
    writer.flush().await
}
