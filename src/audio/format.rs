//! Audio stream format descriptions.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Byte order of samples on the wire. AES67 payloads are big-endian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ByteOrder {
    #[default]
    Be,
    Le,
}

impl ByteOrder {
    /// The native byte order of this host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Be
        } else {
            Self::Le
        }
    }
}

/// Linear PCM sample encodings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AudioEncoding {
    PcmU8,
    #[default]
    PcmS16,
    PcmS24,
    PcmF32,
    PcmF64,
}

impl AudioEncoding {
    pub const fn bytes_per_sample(self) -> u32 {
        match self {
            Self::PcmU8 => 1,
            Self::PcmS16 => 2,
            Self::PcmS24 => 3,
            Self::PcmF32 => 4,
            Self::PcmF64 => 8,
        }
    }

    /// The byte value representing silence: 0x80 for unsigned 8-bit samples,
    /// 0x00 for everything else.
    pub const fn ground_value(self) -> u8 {
        match self {
            Self::PcmU8 => 0x80,
            _ => 0x00,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelOrdering {
    #[default]
    Interleaved,
    NonInterleaved,
}

/// A complete audio stream format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AudioFormat {
    pub byte_order: ByteOrder,
    pub encoding: AudioEncoding,
    pub ordering: ChannelOrdering,
    pub sample_rate: u32,
    pub num_channels: u32,
}

impl AudioFormat {
    pub const fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.num_channels > 0
    }

    pub const fn bytes_per_frame(&self) -> u32 {
        self.num_channels * self.encoding.bytes_per_sample()
    }

    pub const fn ground_value(&self) -> u8 {
        self.encoding.ground_value()
    }
}

/// Nominal duration of the audio carried in one RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PacketTime {
    pub microseconds: u32,
}

impl PacketTime {
    /// The AES67 default of 1 ms.
    pub const MS_1: Self = Self { microseconds: 1000 };
    /// 250 microseconds, the low-latency class.
    pub const US_250: Self = Self { microseconds: 250 };
    /// 125 microseconds.
    pub const US_125: Self = Self { microseconds: 125 };
    /// 4 ms, the high-capacity class.
    pub const MS_4: Self = Self { microseconds: 4000 };

    pub const fn from_micros(microseconds: u32) -> Self {
        Self { microseconds }
    }

    pub fn from_millis(milliseconds: f64) -> Self {
        Self {
            microseconds: (milliseconds * 1000.0).round() as u32,
        }
    }

    pub fn millis(&self) -> f64 {
        self.microseconds as f64 / 1000.0
    }

    /// The number of frames per packet at the given clock rate.
    pub fn framecount(&self, sample_rate: u32) -> u32 {
        (sample_rate as f64 * self.microseconds as f64 / 1_000_000.0).round() as u32
    }
}

impl Default for PacketTime {
    fn default() -> Self {
        Self::MS_1
    }
}
