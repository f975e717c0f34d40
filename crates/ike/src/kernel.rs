//! Kernel dataplane boundary
//!
//! The negotiation engine never touches the IPsec stack directly. It asks
//! the kernel for inbound SPIs/CPIs while building or answering Quick Mode
//! proposals, and hands completed SAs back for installation. Routing (the
//! "eroute" that traps outbound traffic) is owned by the kernel too.
//!
//! [`MemoryKernel`] keeps everything in memory and is what the tests and
//! the standalone daemon use.

use crate::error::{Error, Result};
use crate::isakmp::{proto, IPCOMP_FIRST_NEGOTIATED, IPCOMP_LAST_NEGOTIATED, IPSEC_DOI_SPI_MIN};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;
use zeroize::Zeroize;

/// Direction of an installed SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaDirection {
    /// Traffic we receive (our SPI)
    Inbound,
    /// Traffic we send (peer's SPI)
    Outbound,
}

/// One unidirectional SA handed to the kernel
#[derive(Clone, PartialEq, Eq)]
pub struct KernelSa {
    /// Protocol (AH, ESP or IPCOMP)
    pub protocol: u8,
    /// SPI (or CPI for IPCOMP)
    pub spi: u32,
    /// Direction
    pub direction: SaDirection,
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Transform id (ESP cipher, AH algorithm or IPCOMP algorithm)
    pub transform_id: u8,
    /// Integrity algorithm attribute value
    pub auth: u16,
    /// Cipher key length in bits (0 = algorithm default)
    pub key_len: u16,
    /// Tunnel mode rather than transport
    pub tunnel: bool,
    /// UDP encapsulation ports when NAT-T is in use
    pub encap_ports: Option<(u16, u16)>,
    /// Keying material for this direction
    pub keymat: Vec<u8>,
    /// Lifetime in seconds
    pub life_seconds: u32,
}

impl std::fmt::Debug for KernelSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSa")
            .field("protocol", &proto::name(self.protocol))
            .field("spi", &format_args!("0x{:08x}", self.spi))
            .field("direction", &self.direction)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("transform_id", &self.transform_id)
            .field("tunnel", &self.tunnel)
            .field("keymat", &"[REDACTED]")
            .finish()
    }
}

impl Drop for KernelSa {
    fn drop(&mut self) {
        self.keymat.zeroize();
    }
}

/// Route request for a connection's client subnets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    /// Connection name (with instance serial)
    pub connection: String,
    /// Our client subnet, as text
    pub our_client: String,
    /// Peer client subnet, as text
    pub peer_client: String,
}

/// Operations the engine needs from the IPsec dataplane
pub trait KernelInterface: Send + Sync {
    /// Allocate an unused inbound SPI for AH or ESP
    fn get_spi(&mut self, protocol: u8) -> Result<u32>;

    /// Allocate an unused inbound CPI for IPCOMP
    fn get_cpi(&mut self) -> Result<u16>;

    /// Is this CPI already used by some SA
    fn cpi_in_use(&self, cpi: u32) -> bool;

    /// Install an SA
    fn install_sa(&mut self, sa: KernelSa) -> Result<()>;

    /// Remove an SA
    fn delete_sa(&mut self, protocol: u8, dst: IpAddr, spi: u32) -> Result<()>;

    /// Install the trap route for a connection
    fn route(&mut self, route: &RouteSpec) -> Result<()>;

    /// Remove the route for a connection
    fn unroute(&mut self, route: &RouteSpec) -> Result<()>;

    /// Look up an installed SA
    fn find_sa(&self, protocol: u8, dst: IpAddr, spi: u32) -> Option<&KernelSa>;

    /// Number of installed SAs
    fn sa_count(&self) -> usize;

    /// Is a route installed for this connection
    fn is_routed(&self, connection: &str) -> bool;
}

/// In-memory kernel
#[derive(Debug, Default)]
pub struct MemoryKernel {
    allocated_spis: HashSet<u32>,
    allocated_cpis: HashSet<u32>,
    sas: HashMap<(u8, IpAddr, u32), KernelSa>,
    routes: HashSet<RouteSpec>,
}

impl MemoryKernel {
    /// Create an empty kernel
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of SPIs handed out so far (AH and ESP)
    pub fn allocated_spi_count(&self) -> usize {
        self.allocated_spis.len()
    }

    /// Installed SAs
    pub fn sas(&self) -> impl Iterator<Item = &KernelSa> {
        self.sas.values()
    }
}

impl KernelInterface for MemoryKernel {
    fn get_spi(&mut self, protocol: u8) -> Result<u32> {
        if protocol != proto::IPSEC_AH && protocol != proto::IPSEC_ESP {
            return Err(Error::Kernel(format!(
                "cannot allocate SPI for {}",
                proto::name(protocol)
            )));
        }
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let spi: u32 = rng.gen_range(IPSEC_DOI_SPI_MIN..=u32::MAX);
            if self.allocated_spis.insert(spi) {
                debug!(protocol = proto::name(protocol), spi = %format_args!("0x{:08x}", spi), "allocated SPI");
                return Ok(spi);
            }
        }
        Err(Error::Kernel("SPI space exhausted".into()))
    }

    fn get_cpi(&mut self) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let cpi = rng.gen_range(IPCOMP_FIRST_NEGOTIATED..=IPCOMP_LAST_NEGOTIATED);
            if self.allocated_cpis.insert(cpi) {
                debug!(cpi, "allocated CPI");
                return Ok(cpi as u16);
            }
        }
        Err(Error::Kernel("CPI space exhausted".into()))
    }

    fn cpi_in_use(&self, cpi: u32) -> bool {
        self.allocated_cpis.contains(&cpi)
            || self
                .sas
                .keys()
                .any(|(p, _, spi)| *p == proto::IPCOMP && *spi == cpi)
    }

    fn install_sa(&mut self, sa: KernelSa) -> Result<()> {
        let key = (sa.protocol, sa.dst, sa.spi);
        if self.sas.contains_key(&key) {
            return Err(Error::Kernel(format!(
                "SA {}.{:08x}@{} already installed",
                proto::name(sa.protocol),
                sa.spi,
                sa.dst
            )));
        }
        if sa.protocol == proto::IPCOMP {
            self.allocated_cpis.insert(sa.spi);
        }
        self.sas.insert(key, sa);
        Ok(())
    }

    fn delete_sa(&mut self, protocol: u8, dst: IpAddr, spi: u32) -> Result<()> {
        match self.sas.remove(&(protocol, dst, spi)) {
            Some(_) => {
                self.allocated_spis.remove(&spi);
                Ok(())
            }
            None => Err(Error::SaNotFound(format!(
                "{}.{:08x}@{}",
                proto::name(protocol),
                spi,
                dst
            ))),
        }
    }

    fn route(&mut self, route: &RouteSpec) -> Result<()> {
        self.routes.insert(route.clone());
        Ok(())
    }

    fn unroute(&mut self, route: &RouteSpec) -> Result<()> {
        if !self.routes.remove(route) {
            return Err(Error::Kernel(format!(
                "no route for \"{}\"",
                route.connection
            )));
        }
        Ok(())
    }

    fn find_sa(&self, protocol: u8, dst: IpAddr, spi: u32) -> Option<&KernelSa> {
        self.sas.get(&(protocol, dst, spi))
    }

    fn sa_count(&self) -> usize {
        self.sas.len()
    }

    fn is_routed(&self, connection: &str) -> bool {
        self.routes.iter().any(|r| r.connection == connection)
    }
}
