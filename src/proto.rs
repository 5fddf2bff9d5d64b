//! Control protocol between the hypervisor and the backend.
//!
//! Every message is a fixed 12-byte header (request kind, flags, payload
//! size, all little-endian u32) followed by a fixed-size payload per
//! request kind. File descriptors ride along as SCM_RIGHTS ancillary data.

use thiserror::Error;

use crate::memory::MAX_REGIONS;

/// Protocol version carried in the low 8 bits of the header flags.
pub const VERSION: u32 = 1;
pub const F_VERSION_MASK: u32 = 0xff;
/// Set in a response to report a failed request.
pub const F_ERROR: u32 = 1 << 31;

/// Queue direction selectors used by queue-scoped requests.
pub const DIRECTION_RX: u32 = 1;
pub const DIRECTION_TX: u32 = 2;

pub const HDR_SIZE: usize = 12;

/// Device feature bits negotiated via GET/SET_FEATURES.
pub mod features {
    pub const SG: u64 = 1 << 0;
    pub const TX_CSUM: u64 = 1 << 1;
    pub const RX_CSUM: u64 = 1 << 2;
    pub const TSO_V4: u64 = 1 << 3;
    pub const TCP_V4_LRO: u64 = 1 << 4;
    pub const TSO_V6: u64 = 1 << 5;
    pub const TCP_V6_LRO: u64 = 1 << 6;
    pub const UFO: u64 = 1 << 7;
    pub const UDP_LRO: u64 = 1 << 8;
    pub const RX_OUT_OF_ORDER: u64 = 1 << 9;
    pub const TX_OUT_OF_ORDER: u64 = 1 << 10;

    /// Any of these widens the maximum receive size to 64 KiB.
    pub const LRO_ANY: u64 = TCP_V4_LRO | TCP_V6_LRO | UDP_LRO;
}

/// Backend status register bits visible to the guest.
pub mod status {
    pub const LINK: u32 = 1 << 0;
    pub const UPGRADE: u32 = 1 << 1;
    pub const RX_ENABLED: u32 = 1 << 2;
    pub const TX_ENABLED: u32 = 1 << 3;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("message truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("protocol version mismatch: expected {VERSION}, got {0}")]
    BadVersion(u32),
    #[error("unknown request kind {0}")]
    UnknownRequest(u32),
    #[error("payload size mismatch: expected {expected}, got {got}")]
    PayloadSizeMismatch { expected: usize, got: usize },
    #[error("too many memory regions: {0}")]
    TooManyRegions(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReqType {
    GetFeatures = 1,
    SetFeatures = 2,
    SetParameters = 3,
    GetPrograms = 4,
    SetMemTable = 5,
    SetQueueCtx = 6,
    SetQueueKick = 7,
    SetQueueIrq = 8,
    SetUpgrade = 9,
    RxEnable = 10,
    TxEnable = 11,
    RxDisable = 12,
    TxDisable = 13,
}

impl ReqType {
    pub fn from_u32(raw: u32) -> Result<Self, ProtoError> {
        Ok(match raw {
            1 => ReqType::GetFeatures,
            2 => ReqType::SetFeatures,
            3 => ReqType::SetParameters,
            4 => ReqType::GetPrograms,
            5 => ReqType::SetMemTable,
            6 => ReqType::SetQueueCtx,
            7 => ReqType::SetQueueKick,
            8 => ReqType::SetQueueIrq,
            9 => ReqType::SetUpgrade,
            10 => ReqType::RxEnable,
            11 => ReqType::TxEnable,
            12 => ReqType::RxDisable,
            13 => ReqType::TxDisable,
            other => return Err(ProtoError::UnknownRequest(other)),
        })
    }

    /// Request payload size this kind must carry.
    pub fn payload_size(self) -> usize {
        match self {
            ReqType::GetFeatures
            | ReqType::GetPrograms
            | ReqType::RxEnable
            | ReqType::TxEnable
            | ReqType::RxDisable
            | ReqType::TxDisable => 0,
            ReqType::SetFeatures => 8,
            ReqType::SetParameters => QueueParams::SIZE,
            ReqType::SetMemTable => MemoryMap::SIZE,
            ReqType::SetQueueCtx => QueueCtx::SIZE,
            ReqType::SetQueueKick | ReqType::SetQueueIrq | ReqType::SetUpgrade => Notifier::SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub reqtype: u32,
    pub flags: u32,
    pub size: u32,
}

impl MsgHeader {
    pub fn request(reqtype: ReqType, size: u32) -> Self {
        Self {
            reqtype: reqtype as u32,
            flags: VERSION,
            size,
        }
    }

    pub fn version(&self) -> u32 {
        self.flags & F_VERSION_MASK
    }

    pub fn is_error(&self) -> bool {
        self.flags & F_ERROR != 0
    }

    pub fn encode(&self, buf: &mut [u8; HDR_SIZE]) {
        buf[0..4].copy_from_slice(&self.reqtype.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < HDR_SIZE {
            return Err(ProtoError::Truncated {
                need: HDR_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            reqtype: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueParams {
    pub num_rx_queues: u32,
    pub num_tx_queues: u32,
    pub num_rx_bufs: u32,
    pub num_tx_bufs: u32,
}

impl QueueParams {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.num_rx_queues.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_tx_queues.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_rx_bufs.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_tx_bufs.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                need: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            num_rx_queues: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            num_tx_queues: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            num_rx_bufs: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            num_tx_bufs: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Response payload for SET_PARAMETERS: the shared-memory context sizes
/// the guest must allocate for each queue of the selected transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtxSizes {
    pub rx_ctx_size: u64,
    pub tx_ctx_size: u64,
}

impl CtxSizes {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.rx_ctx_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tx_ctx_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                need: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            rx_ctx_size: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            tx_ctx_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionDesc {
    pub gpa: u64,
    pub size: u64,
    pub hv_vaddr: u64,
    pub mmap_offset: u64,
}

impl RegionDesc {
    pub const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.gpa.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.hv_vaddr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.mmap_offset.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            gpa: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            hv_vaddr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            mmap_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMap {
    pub num_regions: u32,
    pub regions: [RegionDesc; MAX_REGIONS],
}

impl MemoryMap {
    pub const SIZE: usize = 8 + MAX_REGIONS * RegionDesc::SIZE;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.num_regions.to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        for (i, region) in self.regions.iter().enumerate() {
            region.encode(&mut buf[8 + i * RegionDesc::SIZE..8 + (i + 1) * RegionDesc::SIZE]);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                need: Self::SIZE,
                got: buf.len(),
            });
        }
        let num_regions = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if num_regions as usize > MAX_REGIONS {
            return Err(ProtoError::TooManyRegions(num_regions));
        }
        let mut regions = [RegionDesc::default(); MAX_REGIONS];
        for (i, region) in regions.iter_mut().enumerate() {
            *region = RegionDesc::decode(&buf[8 + i * RegionDesc::SIZE..]);
        }
        Ok(Self {
            num_regions,
            regions,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCtx {
    pub queue_idx: u32,
    pub direction: u32,
    /// Guest physical address of the queue context; 0 detaches the queue.
    pub gpa: u64,
}

impl QueueCtx {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.queue_idx.to_le_bytes());
        buf[4..8].copy_from_slice(&self.direction.to_le_bytes());
        buf[8..16].copy_from_slice(&self.gpa.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                need: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            queue_idx: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            direction: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            gpa: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Notifier {
    pub queue_idx: u32,
    pub direction: u32,
}

impl Notifier {
    pub const SIZE: usize = 8;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.queue_idx.to_le_bytes());
        buf[4..8].copy_from_slice(&self.direction.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                need: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            queue_idx: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            direction: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

/// Virtio-net header prepended to frames when the port negotiates
/// offloads (12 bytes, little-endian).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

pub const VNET_HDR_LEN: usize = 12;

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_UDP: u8 = 3;
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;

impl VirtioNetHdr {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.flags;
        buf[1] = self.gso_type;
        buf[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        buf[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        buf[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < VNET_HDR_LEN {
            return Err(ProtoError::Truncated {
                need: VNET_HDR_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            flags: buf[0],
            gso_type: buf[1],
            hdr_len: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            gso_size: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            csum_start: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            csum_offset: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            num_buffers: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
        })
    }
}

/// A queue buffer count is valid iff it is a power of two in [16, 8192].
pub fn num_bufs_valid(num_bufs: u64) -> bool {
    (16..=8192).contains(&num_bufs) && num_bufs.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = MsgHeader::request(ReqType::SetParameters, QueueParams::SIZE as u32);
        let mut buf = [0u8; HDR_SIZE];
        hdr.encode(&mut buf);
        let back = MsgHeader::decode(&buf).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(back.version(), VERSION);
        assert!(!back.is_error());
    }

    #[test]
    fn test_error_flag() {
        let mut hdr = MsgHeader::request(ReqType::GetFeatures, 0);
        hdr.flags |= F_ERROR;
        assert!(hdr.is_error());
        assert_eq!(hdr.version(), VERSION);
    }

    #[test]
    fn test_reqtype_mapping() {
        for raw in 1..=13u32 {
            let kind = ReqType::from_u32(raw).unwrap();
            assert_eq!(kind as u32, raw);
        }
        assert_eq!(ReqType::from_u32(0), Err(ProtoError::UnknownRequest(0)));
        assert_eq!(ReqType::from_u32(14), Err(ProtoError::UnknownRequest(14)));
    }

    #[test]
    fn test_payload_sizes() {
        assert_eq!(ReqType::GetFeatures.payload_size(), 0);
        assert_eq!(ReqType::SetFeatures.payload_size(), 8);
        assert_eq!(ReqType::SetParameters.payload_size(), 16);
        assert_eq!(ReqType::SetMemTable.payload_size(), 8 + 8 * 32);
        assert_eq!(ReqType::SetQueueCtx.payload_size(), 16);
        assert_eq!(ReqType::SetQueueKick.payload_size(), 8);
        assert_eq!(ReqType::RxEnable.payload_size(), 0);
    }

    #[test]
    fn test_queue_params_roundtrip() {
        let params = QueueParams {
            num_rx_queues: 1,
            num_tx_queues: 1,
            num_rx_bufs: 256,
            num_tx_bufs: 512,
        };
        let mut buf = [0u8; QueueParams::SIZE];
        params.encode(&mut buf);
        assert_eq!(QueueParams::decode(&buf).unwrap(), params);
    }

    #[test]
    fn test_memory_map_roundtrip() {
        let mut map = MemoryMap {
            num_regions: 2,
            ..Default::default()
        };
        map.regions[0] = RegionDesc {
            gpa: 0x1000,
            size: 0x10000,
            hv_vaddr: 0x7f00_0000_0000,
            mmap_offset: 0,
        };
        map.regions[1] = RegionDesc {
            gpa: 0x8000_0000,
            size: 0x2000,
            hv_vaddr: 0x7f00_1000_0000,
            mmap_offset: 0x1000,
        };
        let mut buf = [0u8; MemoryMap::SIZE];
        map.encode(&mut buf);
        assert_eq!(MemoryMap::decode(&buf).unwrap(), map);
    }

    #[test]
    fn test_memory_map_too_many_regions() {
        let mut buf = [0u8; MemoryMap::SIZE];
        buf[0..4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            MemoryMap::decode(&buf),
            Err(ProtoError::TooManyRegions(9))
        );
    }

    #[test]
    fn test_queue_ctx_roundtrip() {
        let ctx = QueueCtx {
            queue_idx: 1,
            direction: DIRECTION_TX,
            gpa: 0xdead_b000,
        };
        let mut buf = [0u8; QueueCtx::SIZE];
        ctx.encode(&mut buf);
        assert_eq!(QueueCtx::decode(&buf).unwrap(), ctx);
    }

    #[test]
    fn test_vnet_hdr_roundtrip() {
        let hdr = VirtioNetHdr {
            flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
            gso_type: VIRTIO_NET_HDR_GSO_TCPV4,
            hdr_len: 54,
            gso_size: 1448,
            csum_start: 34,
            csum_offset: 16,
            num_buffers: 1,
        };
        let mut buf = [0u8; VNET_HDR_LEN];
        hdr.encode(&mut buf);
        assert_eq!(VirtioNetHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_num_bufs_valid() {
        assert!(num_bufs_valid(16));
        assert!(num_bufs_valid(256));
        assert!(num_bufs_valid(8192));
        assert!(!num_bufs_valid(8));
        assert!(!num_bufs_valid(24));
        assert!(!num_bufs_valid(16384));
        assert!(!num_bufs_valid(0));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            MsgHeader::decode(&[0u8; 4]),
            Err(ProtoError::Truncated { need: 12, got: 4 })
        ));
    }
}
