//! ARP over Ethernet wire format.
//!
//! Only the IPv4-over-Ethernet flavour of ARP is modelled; anything else is
//! rejected at parse time. Types are `#[repr(C, packed)]` with zerocopy
//! derives so frames are read and written without copying field by field.
//! Multi-byte fields are network byte order.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// Minimum Ethernet frame length without FCS. Shorter frames are zero-padded.
pub const ETH_MIN_FRAME: usize = 60;

// ── MAC address ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

// ── Ethernet ──────────────────────────────────────────────────────────────────

/// Wire size: 14 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EthernetHeader {
    pub destination: [u8; 6],
    pub source: [u8; 6],
    pub ethertype: U16<NetworkEndian>,
}

assert_eq_size!(EthernetHeader, [u8; 14]);

// ── ARP ───────────────────────────────────────────────────────────────────────

/// IPv4-over-Ethernet ARP payload.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ArpPacket {
    /// Hardware type, 1 for Ethernet.
    pub htype: U16<NetworkEndian>,
    /// Protocol type, 0x0800 for IPv4.
    pub ptype: U16<NetworkEndian>,
    pub hlen: u8,
    pub plen: u8,
    /// 1 = request, 2 = reply.
    pub oper: U16<NetworkEndian>,
    /// Sender hardware address.
    pub sha: [u8; 6],
    /// Sender protocol address.
    pub spa: [u8; 4],
    /// Target hardware address. Zero in requests.
    pub tha: [u8; 6],
    /// Target protocol address, the one being resolved.
    pub tpa: [u8; 4],
}

assert_eq_size!(ArpPacket, [u8; 28]);

/// A full ARP frame as seen on a packet socket.
///
/// Wire size: 42 bytes (padded to 60 on transmit).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ArpFrame {
    pub ethernet: EthernetHeader,
    pub arp: ArpPacket,
}

assert_eq_size!(ArpFrame, [u8; 42]);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("not an ARP frame (ethertype {0:#06x})")]
    NotArp(u16),
    #[error("unsupported ARP flavour: htype {htype}, ptype {ptype:#06x}, hlen {hlen}, plen {plen}")]
    Unsupported {
        htype: u16,
        ptype: u16,
        hlen: u8,
        plen: u8,
    },
}

impl ArpFrame {
    /// Parse and validate an IPv4-over-Ethernet ARP frame. Trailing padding is ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let frame = ArpFrame::read_from_prefix(buf).ok_or(FrameError::Truncated(buf.len()))?;

        let ethertype = frame.ethernet.ethertype.get();
        if ethertype != ETHERTYPE_ARP {
            return Err(FrameError::NotArp(ethertype));
        }

        let arp = &frame.arp;
        let (htype, ptype, hlen, plen) = (arp.htype.get(), arp.ptype.get(), arp.hlen, arp.plen);
        if htype != ARP_HTYPE_ETHERNET || ptype != ETHERTYPE_IPV4 || hlen != 6 || plen != 4 {
            return Err(FrameError::Unsupported {
                htype,
                ptype,
                hlen,
                plen,
            });
        }

        Ok(frame)
    }

    /// Build a broadcast request for `target`. Used by tests and diagnostics.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target: Ipv4Addr) -> Self {
        ArpFrame {
            ethernet: EthernetHeader {
                destination: MacAddr::BROADCAST.0,
                source: sender_mac.0,
                ethertype: U16::new(ETHERTYPE_ARP),
            },
            arp: ArpPacket {
                htype: U16::new(ARP_HTYPE_ETHERNET),
                ptype: U16::new(ETHERTYPE_IPV4),
                hlen: 6,
                plen: 4,
                oper: U16::new(ARP_OP_REQUEST),
                sha: sender_mac.0,
                spa: sender_ip.octets(),
                tha: [0; 6],
                tpa: target.octets(),
            },
        }
    }

    /// The reply to this request claiming `owner` as the link address of the target.
    pub fn reply_from(&self, owner: MacAddr) -> Self {
        let req = &self.arp;
        ArpFrame {
            ethernet: EthernetHeader {
                destination: req.sha,
                source: owner.0,
                ethertype: U16::new(ETHERTYPE_ARP),
            },
            arp: ArpPacket {
                htype: U16::new(ARP_HTYPE_ETHERNET),
                ptype: U16::new(ETHERTYPE_IPV4),
                hlen: 6,
                plen: 4,
                oper: U16::new(ARP_OP_REPLY),
                sha: owner.0,
                spa: req.tpa,
                tha: req.sha,
                tpa: req.spa,
            },
        }
    }

    pub fn operation(&self) -> u16 {
        self.arp.oper.get()
    }

    pub fn sender_mac(&self) -> MacAddr {
        MacAddr(self.arp.sha)
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.arp.spa)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.arp.tpa)
    }

    pub fn source_mac(&self) -> MacAddr {
        MacAddr(self.ethernet.source)
    }

    /// Serialize, zero-padded to the Ethernet minimum.
    pub fn to_padded_bytes(&self) -> Vec<u8> {
        let mut out = self.as_bytes().to_vec();
        out.resize(ETH_MIN_FRAME, 0);
        out
    }
}
