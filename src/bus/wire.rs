//! Newline-delimited JSON frames spoken between [`TcpTransport`](super::TcpTransport)
//! and [`BrokerServer`](super::BrokerServer).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::BusError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish {
        exchange: String,
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Re-sending a bind for a known id replaces the old binding.
    Bind {
        binding: u64,
        exchange: String,
        patterns: Vec<String>,
    },
    Unbind {
        binding: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Deliver {
        binding: u64,
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Error {
        message: String,
    },
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_frame(frame).map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
