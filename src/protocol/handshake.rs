//! Connection phase: server greeting and client handshake response
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::capabilities::*;
use super::status::SERVER_STATUS_AUTOCOMMIT;
use super::PayloadReader;
use crate::error::{RutaError, RutaResult};

pub const AUTH_PLUGIN_NAME: &str = "mysql_native_password";

/// utf8mb4_general_ci
pub const DEFAULT_CHARSET: u8 = 45;

const SCRAMBLE_LEN: usize = 20;

/// Protocol::HandshakeV10 as sent by the proxy
#[derive(Debug, Clone)]
pub struct Greeting {
    pub connection_id: u32,
    pub server_version: String,
    pub scramble: [u8; SCRAMBLE_LEN],
}

impl Greeting {
    pub fn new<S: Into<String>>(connection_id: u32, server_version: S) -> Self {
        let mut rng = rand::thread_rng();
        let mut scramble = [0u8; SCRAMBLE_LEN];
        for byte in scramble.iter_mut() {
            // Printable, never NUL
            *byte = rng.gen_range(0x21..0x7f);
        }
        Self {
            connection_id,
            server_version: server_version.into(),
            scramble,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(10);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);
        buf.put_u16_le((SERVER_CAPABILITIES & 0xFFFF) as u16);
        buf.put_u8(DEFAULT_CHARSET);
        buf.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
        buf.put_u16_le((SERVER_CAPABILITIES >> 16) as u16);
        buf.put_u8(SCRAMBLE_LEN as u8 + 1);
        buf.put_bytes(0, 10);
        buf.extend_from_slice(&self.scramble[8..]);
        buf.put_u8(0);
        buf.extend_from_slice(AUTH_PLUGIN_NAME.as_bytes());
        buf.put_u8(0);
        buf
    }
}

/// Protocol::HandshakeResponse41
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Bytes,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> RutaResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let capabilities = reader.u32_le()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(RutaError::protocol("client does not speak protocol 4.1"));
        }
        let max_packet_size = reader.u32_le()?;
        let charset = reader.u8()?;
        reader.skip(23)?;

        if capabilities & CLIENT_SSL != 0 && reader.is_empty() {
            return Err(RutaError::protocol("TLS is not supported"));
        }

        let username = String::from_utf8_lossy(reader.null_str()).into_owned();

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            reader.lenenc_bytes()?
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = reader.u8()?;
            reader.bytes(usize::from(len))?
        } else {
            reader.null_str()
        };
        let auth_response = Bytes::copy_from_slice(auth_response);

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !reader.is_empty() {
            let name = reader.null_str();
            (!name.is_empty()).then(|| String::from_utf8_lossy(name).into_owned())
        } else {
            None
        };

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
            Some(String::from_utf8_lossy(reader.null_str()).into_owned())
        } else {
            None
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_response,
            database,
            auth_plugin,
        })
    }
}
