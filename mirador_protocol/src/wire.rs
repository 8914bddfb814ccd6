//! Wire format of the accelerated video stream.
//!
//! Each encoded frame starts with a fixed little-endian header, optionally
//! followed by a codec-private header and then the encoded payload. The same
//! layout is used on the sidecar socket and inside in-band frame messages.

use std::io::Read;
use std::mem;

use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};

/// Codec tag value carried on the wire for MPEG4; anything else is H.264.
pub const MPEG4_CODEC_TAG: u32 = 60_000;

/// Size in bytes of the fixed frame header.
pub const FIXED_HEADER_SIZE: usize = mem::size_of::<FrameHeader>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxCodec {
    Mpeg4,
    H264,
}

/// Fixed frame header, in wire order. All fields are little-endian u32.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    pub total_size: u32,
    pub header_size: u32,
    pub data_size: u32,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub codec: u32,
    pub private_header_size: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FIXED_HEADER_SIZE]) -> Self {
        let mut header: FrameHeader = bytemuck::pod_read_unaligned(bytes);
        header.to_native();
        header
    }

    pub fn to_wire(&self) -> [u8; FIXED_HEADER_SIZE] {
        let mut wire = *self;
        wire.to_native();
        let mut bytes = [0u8; FIXED_HEADER_SIZE];
        bytes.copy_from_slice(bytemuck::bytes_of(&wire));
        bytes
    }

    fn to_native(&mut self) {
        self.total_size = u32::from_le(self.total_size);
        self.header_size = u32::from_le(self.header_size);
        self.data_size = u32::from_le(self.data_size);
        self.width = u32::from_le(self.width);
        self.height = u32::from_le(self.height);
        self.sequence = u32::from_le(self.sequence);
        self.codec = u32::from_le(self.codec);
        self.private_header_size = u32::from_le(self.private_header_size);
    }

    pub fn codec(&self) -> AuxCodec {
        if self.codec == MPEG4_CODEC_TAG {
            AuxCodec::Mpeg4
        } else {
            AuxCodec::H264
        }
    }

    /// Checks the two size invariants the peer must uphold. A failure here
    /// usually means the socket is connected to the wrong port.
    pub fn validate(&self) -> Result<()> {
        if self.total_size != self.header_size + self.data_size {
            bail!(
                "frame header mismatch: total {} != header {} + data {}",
                self.total_size,
                self.header_size,
                self.data_size
            );
        }
        if self.header_size != FIXED_HEADER_SIZE as u32 + self.private_header_size {
            bail!(
                "frame header mismatch: header {} != fixed {} + private {}",
                self.header_size,
                FIXED_HEADER_SIZE,
                self.private_header_size
            );
        }
        Ok(())
    }
}

/// MPEG4 elementary-stream private header. Only the first two fields carry
/// information; the remainder of the private area pads the combined header
/// out to a 32-byte multiple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mp4EsHeader {
    pub es_header_size: u32,
    pub sync: u32,
}

impl Mp4EsHeader {
    pub fn parse(private: &[u8]) -> Result<Self> {
        if private.len() < 8 {
            bail!("private header too short: {} bytes", private.len());
        }
        Ok(Self {
            es_header_size: u32::from_le_bytes(private[0..4].try_into().unwrap()),
            sync: u32::from_le_bytes(private[4..8].try_into().unwrap()),
        })
    }
}

/// A fully read encoded frame: header, optional private header, payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub header: FrameHeader,
    pub private: Option<Mp4EsHeader>,
    pub data: Vec<u8>,
}

impl EncodedFrame {
    /// Parses an in-band frame payload holding the full wire layout.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < FIXED_HEADER_SIZE {
            bail!("frame payload too short: {} bytes", payload.len());
        }
        let header = FrameHeader::parse(payload[..FIXED_HEADER_SIZE].try_into().unwrap());
        header.validate()?;

        let private_len = header.private_header_size as usize;
        let data_len = header.data_size as usize;
        let expected = FIXED_HEADER_SIZE + private_len + data_len;
        if payload.len() != expected {
            bail!(
                "frame payload size {} does not match header ({} expected)",
                payload.len(),
                expected
            );
        }

        let private = if private_len > 0 {
            Some(Mp4EsHeader::parse(
                &payload[FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + private_len],
            )?)
        } else {
            None
        };

        Ok(Self {
            header,
            private,
            data: payload[FIXED_HEADER_SIZE + private_len..].to_vec(),
        })
    }

    /// Reads one frame off a sidecar byte stream.
    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        reader
            .read_exact(&mut fixed)
            .context("reading frame header")?;
        let header = FrameHeader::parse(&fixed);

        let private = if header.private_header_size > 0 {
            let mut buf = vec![0u8; header.private_header_size as usize];
            reader
                .read_exact(&mut buf)
                .context("reading private header")?;
            Some(Mp4EsHeader::parse(&buf)?)
        } else {
            None
        };

        header.validate()?;

        let mut data = vec![0u8; header.data_size as usize];
        reader.read_exact(&mut data).context("reading frame data")?;

        Ok(Self {
            header,
            private,
            data,
        })
    }

    pub fn codec(&self) -> AuxCodec {
        self.header.codec()
    }
}
