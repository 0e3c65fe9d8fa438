//! UDP帧格式
//!
//! 每帧先发一个帧头数据报, 之后紧跟 `packet_count` 个分包数据报:
//!
//! ```text
//! 帧头: [magic 10B][packet_count u32 BE][frame_id u32 BE][capture_ts f64 BE][server_time f64 BE]
//! 分包: [index u32 BE][payload ≤ 1020B]
//! ```
//!
//! 分包按 0..packet_count 的顺序拼接即为完整的 JPEG 数据。

use crate::error::{Error, Result};

/// 帧起始标记
pub const FRAME_MAGIC: [u8; 10] = [0x0a, 0x5f, 0x92, 0xc3, 0x9c, 0x3e, 0xbe, 0xfe, 0xc1, 0x98];

/// 单个数据报的最大长度
pub const DATAGRAM_SIZE: usize = 1024;
pub const PACKET_INDEX_LEN: usize = 4;
/// 每个分包可携带的最大负载
pub const MAX_PAYLOAD: usize = DATAGRAM_SIZE - PACKET_INDEX_LEN;
pub const HEADER_LEN: usize = FRAME_MAGIC.len() + 4 + 4 + 8 + 8;
/// 单帧允许的最大分包数 (约 8MB 的JPEG)
pub const MAX_PACKETS_PER_FRAME: u32 = 8192;

/// 帧头
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameHeader {
    pub packet_count: u32,
    pub frame_id: u32,
    pub capture_timestamp: f64,      // 远端采集时间 (Unix秒)
    pub server_processing_time: f64, // 远端编码耗时 (秒)
}

impl FrameHeader {
    /// 是否以帧起始标记开头
    pub fn is_header(datagram: &[u8]) -> bool {
        datagram.len() >= FRAME_MAGIC.len() && datagram[..FRAME_MAGIC.len()] == FRAME_MAGIC
    }

    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if !Self::is_header(datagram) {
            return Err(Error::Framing("缺少帧起始标记".into()));
        }
        if datagram.len() < HEADER_LEN {
            return Err(Error::Framing(format!(
                "帧头过短: {} < {}",
                datagram.len(),
                HEADER_LEN
            )));
        }

        let body = &datagram[FRAME_MAGIC.len()..HEADER_LEN];
        let packet_count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        if packet_count > MAX_PACKETS_PER_FRAME {
            return Err(Error::Framing(format!(
                "分包数过大: {} > {}",
                packet_count, MAX_PACKETS_PER_FRAME
            )));
        }
        Ok(Self {
            packet_count,
            frame_id: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            capture_timestamp: f64::from_be_bytes(read_8(&body[8..16])),
            server_processing_time: f64::from_be_bytes(read_8(&body[16..24])),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.extend_from_slice(&self.packet_count.to_be_bytes());
        buf.extend_from_slice(&self.frame_id.to_be_bytes());
        buf.extend_from_slice(&self.capture_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.server_processing_time.to_be_bytes());
        buf
    }
}

fn read_8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// 分包 (借用数据报内容)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Packet<'a> {
    pub index: u32,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self> {
        if datagram.len() < PACKET_INDEX_LEN {
            return Err(Error::Framing(format!("分包过短: {} 字节", datagram.len())));
        }
        let index = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        Ok(Self {
            index,
            payload: &datagram[PACKET_INDEX_LEN..],
        })
    }
}

pub fn encode_packet(index: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_INDEX_LEN + payload.len());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// 把一帧编码后的图像切成数据报序列 (帧头 + 分包)
///
/// `chunk` 会被限制在 1..=MAX_PAYLOAD。
pub fn encode_frame(
    frame_id: u32,
    capture_timestamp: f64,
    server_processing_time: f64,
    data: &[u8],
    chunk: usize,
) -> Vec<Vec<u8>> {
    let chunk = chunk.clamp(1, MAX_PAYLOAD);
    let packets: Vec<&[u8]> = data.chunks(chunk).collect();

    let header = FrameHeader {
        packet_count: packets.len() as u32,
        frame_id,
        capture_timestamp,
        server_processing_time,
    };

    let mut datagrams = Vec::with_capacity(packets.len() + 1);
    datagrams.push(header.encode());
    for (i, payload) in packets.into_iter().enumerate() {
        datagrams.push(encode_packet(i as u32, payload));
    }
    datagrams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader {
            packet_count: 3,
            frame_id: 0x01020304,
            capture_timestamp: 1.5,
            server_processing_time: 0.25,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[..10], &FRAME_MAGIC);
        assert_eq!(&bytes[10..14], &[0, 0, 0, 3]);
        assert_eq!(&bytes[14..18], &[1, 2, 3, 4]);
        assert_eq!(&bytes[18..26], &1.5f64.to_be_bytes());
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_missing_magic() {
        let mut bytes = FrameHeader {
            packet_count: 1,
            frame_id: 1,
            capture_timestamp: 0.0,
            server_processing_time: 0.0,
        }
        .encode();
        bytes[0] = 0;
        assert!(matches!(FrameHeader::parse(&bytes), Err(Error::Framing(_))));
    }

    #[test]
    fn test_header_rejects_huge_packet_count() {
        let mut header = FrameHeader {
            packet_count: MAX_PACKETS_PER_FRAME,
            frame_id: 7,
            capture_timestamp: 0.0,
            server_processing_time: 0.0,
        };
        assert!(FrameHeader::parse(&header.encode()).is_ok());

        header.packet_count = MAX_PACKETS_PER_FRAME + 1;
        assert!(matches!(
            FrameHeader::parse(&header.encode()),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = &FrameHeader {
            packet_count: 1,
            frame_id: 1,
            capture_timestamp: 0.0,
            server_processing_time: 0.0,
        }
        .encode()[..20];
        assert!(FrameHeader::is_header(bytes));
        assert!(matches!(FrameHeader::parse(bytes), Err(Error::Framing(_))));
    }

    #[test]
    fn test_packet_parse() {
        let datagram = encode_packet(7, b"abc");
        let packet = Packet::parse(&datagram).unwrap();
        assert_eq!(packet.index, 7);
        assert_eq!(packet.payload, b"abc");
        assert!(Packet::parse(&[0, 1]).is_err());
    }

    #[test]
    fn test_encode_frame_splits_payload() {
        let data = vec![9u8; 2500];
        let datagrams = encode_frame(42, 10.0, 0.01, &data, MAX_PAYLOAD);
        assert_eq!(datagrams.len(), 4);

        let header = FrameHeader::parse(&datagrams[0]).unwrap();
        assert_eq!(header.packet_count, 3);
        assert_eq!(header.frame_id, 42);

        let lens: Vec<usize> = datagrams[1..].iter().map(|d| d.len()).collect();
        assert_eq!(lens, vec![1024, 1024, 4 + 2500 - 2 * 1020]);
        assert!(datagrams.iter().all(|d| d.len() <= DATAGRAM_SIZE));
    }
}
