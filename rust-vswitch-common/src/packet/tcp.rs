//! TCP segments.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;

use super::checksum;
use super::ensure_len;
use super::ip::IP_PROTOCOL_TCP;
use crate::error::Error;

pub const TCP_FLAGS_FIN: u8 = 0x01;
pub const TCP_FLAGS_SYN: u8 = 0x02;
pub const TCP_FLAGS_RST: u8 = 0x04;
pub const TCP_FLAGS_PSH: u8 = 0x08;
pub const TCP_FLAGS_ACK: u8 = 0x10;
pub const TCP_FLAGS_URG: u8 = 0x20;

pub const TCP_OPTION_END: u8 = 0;
pub const TCP_OPTION_NOP: u8 = 1;
pub const TCP_OPTION_MSS: u8 = 2;
pub const TCP_OPTION_WINDOW_SCALE: u8 = 3;

const TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Bytes,
}

impl TcpOption {
    pub fn mss(mss: u16) -> Self {
        Self {
            kind: TCP_OPTION_MSS,
            data: Bytes::copy_from_slice(&mss.to_be_bytes()),
        }
    }

    pub fn window_scale(shift: u8) -> Self {
        Self {
            kind: TCP_OPTION_WINDOW_SCALE,
            data: Bytes::copy_from_slice(&[shift]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub data: Bytes,
}

impl TcpPacket {
    pub fn new(src_port: u16, dst_port: u16, seq_num: u32, ack_num: u32, flags: u8, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            flags,
            window,
            urgent_pointer: 0,
            options: Vec::new(),
            data: Bytes::new(),
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAGS_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAGS_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAGS_FIN != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAGS_PSH != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAGS_RST != 0
    }

    pub fn mss(&self) -> Option<u16> {
        self.options
            .iter()
            .find(|o| o.kind == TCP_OPTION_MSS && o.data.len() == 2)
            .map(|o| u16::from_be_bytes([o.data[0], o.data[1]]))
    }

    /// Window-scale shift count, clamped to 14 as RFC 7323 requires.
    pub fn window_scale(&self) -> Option<u8> {
        self.options
            .iter()
            .find(|o| o.kind == TCP_OPTION_WINDOW_SCALE && o.data.len() == 1)
            .map(|o| o.data[0].min(14))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, TCP_HEADER_LEN, "tcp header")?;
        let data_offset = (buf[12] >> 4) as usize * 4;
        if data_offset < TCP_HEADER_LEN {
            return Err(Error::Decode(format!("tcp data offset too small: {}", data_offset)));
        }
        ensure_len(buf, data_offset, "tcp options")?;

        let options = decode_options(&buf[TCP_HEADER_LEN..data_offset])?;

        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq_num: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack_num: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[13] & 0x3f,
            window: u16::from_be_bytes([buf[14], buf[15]]),
            urgent_pointer: u16::from_be_bytes([buf[18], buf[19]]),
            options,
            data: Bytes::copy_from_slice(&buf[data_offset..]),
        })
    }

    /// Encode with the checksum over the pseudo header of `src`/`dst`.
    pub fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Bytes {
        let mut opts = BytesMut::new();
        for opt in &self.options {
            match opt.kind {
                TCP_OPTION_END | TCP_OPTION_NOP => opts.put_u8(opt.kind),
                kind => {
                    opts.put_u8(kind);
                    opts.put_u8((2 + opt.data.len()) as u8);
                    opts.put_slice(&opt.data);
                }
            }
        }
        while opts.len() % 4 != 0 {
            opts.put_u8(TCP_OPTION_END);
        }

        let header_len = TCP_HEADER_LEN + opts.len();
        let mut buf = BytesMut::with_capacity(header_len + self.data.len());
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq_num);
        buf.put_u32(self.ack_num);
        buf.put_u8(((header_len / 4) as u8) << 4);
        buf.put_u8(self.flags);
        buf.put_u16(self.window);
        buf.put_u16(0);
        buf.put_u16(self.urgent_pointer);
        buf.put_slice(&opts);
        buf.put_slice(&self.data);

        let sum = checksum::transport_checksum(src, dst, IP_PROTOCOL_TCP, &buf);
        buf[16..18].copy_from_slice(&sum.to_be_bytes());
        buf.freeze()
    }

    pub fn description(&self) -> String {
        format!(
            "tcp{{{} -> {}, seq={}, ack={}, flags={:#04x}, win={}, len={}}}",
            self.src_port,
            self.dst_port,
            self.seq_num,
            self.ack_num,
            self.flags,
            self.window,
            self.data.len()
        )
    }
}

fn decode_options(mut buf: &[u8]) -> Result<Vec<TcpOption>, Error> {
    let mut options = Vec::new();
    while let Some(&kind) = buf.first() {
        match kind {
            TCP_OPTION_END => break,
            TCP_OPTION_NOP => buf = &buf[1..],
            _ => {
                ensure_len(buf, 2, "tcp option length")?;
                let len = buf[1] as usize;
                if len < 2 {
                    return Err(Error::Decode(format!("tcp option {} has length {}", kind, len)));
                }
                ensure_len(buf, len, "tcp option value")?;
                options.push(TcpOption {
                    kind,
                    data: Bytes::copy_from_slice(&buf[2..len]),
                });
                buf = &buf[len..];
            }
        }
    }
    Ok(options)
}

/* ---------------------------------------------------------------- *
 * Sequence number arithmetic (modulo 2^32)
 * ---------------------------------------------------------------- */

pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}
