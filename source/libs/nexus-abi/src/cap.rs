// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability references passed between domains.
//!
//! A [`Capability`] is an unforgeable handle: it can only be obtained from the kernel model
//! (`HostKernel`, `LmpChannel`) or by receiving it on a channel. Cloning a capability models a
//! capability copy; both copies name the same kernel object and the same [`CapId`].

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::frame::Frame;
use crate::lmp::EndpointCap;

static NEXT_CAP_ID: AtomicU64 = AtomicU64::new(1);

/// Kernel-wide identifier of the object a capability refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapId(u64);

impl CapId {
    /// Issues a fresh identifier.
    pub(crate) fn fresh() -> Self {
        Self(NEXT_CAP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for diagnostics.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Kind of kernel object behind a capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapKind {
    /// LMP endpoint.
    Endpoint,
    /// Mappable frame.
    Frame,
    /// Untyped RAM that can be retyped into frames.
    Ram,
    /// Device object handed out through the special-cap query.
    Device,
}

/// Untyped RAM region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamCap {
    pub(crate) id: CapId,
    /// Physical base address.
    pub base: u64,
    /// Size in bytes.
    pub size: usize,
}

impl RamCap {
    /// Identifier of the RAM object.
    pub fn id(&self) -> CapId {
        self.id
    }
}

/// Device objects that can be requested from the init domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SpecialCapKind {
    /// Interrupt table capability.
    Irq = 1,
    /// Device register window.
    DeviceRegion = 2,
}

impl SpecialCapKind {
    /// Decodes the wire value carried in a request word.
    pub fn from_word(word: usize) -> Option<Self> {
        match word {
            1 => Some(Self::Irq),
            2 => Some(Self::DeviceRegion),
            _ => None,
        }
    }
}

/// Device capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCap {
    pub(crate) id: CapId,
    /// Which special object this is.
    pub kind: SpecialCapKind,
    /// Physical base of the device window (0 for IRQ).
    pub base: u64,
    /// Size of the device window in bytes.
    pub size: usize,
}

impl DeviceCap {
    /// Identifier of the device object.
    pub fn id(&self) -> CapId {
        self.id
    }
}

/// A capability that may travel with an LMP message.
#[derive(Clone, Debug)]
pub enum Capability {
    /// Endpoint to send messages to.
    Endpoint(EndpointCap),
    /// Frame of shared memory.
    Frame(Frame),
    /// Untyped RAM.
    Ram(RamCap),
    /// Device object.
    Device(DeviceCap),
}

impl Capability {
    /// Identifier of the referenced object.
    pub fn id(&self) -> CapId {
        match self {
            Self::Endpoint(ep) => ep.id(),
            Self::Frame(frame) => frame.id(),
            Self::Ram(ram) => ram.id,
            Self::Device(dev) => dev.id,
        }
    }

    /// Kind of the referenced object.
    pub fn kind(&self) -> CapKind {
        match self {
            Self::Endpoint(_) => CapKind::Endpoint,
            Self::Frame(_) => CapKind::Frame,
            Self::Ram(_) => CapKind::Ram,
            Self::Device(_) => CapKind::Device,
        }
    }

    /// Returns the frame if this is a frame capability.
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Returns the endpoint if this is an endpoint capability.
    pub fn into_endpoint(self) -> Option<EndpointCap> {
        match self {
            Self::Endpoint(ep) => Some(ep),
            _ => None,
        }
    }

    /// Returns the RAM region if this is a RAM capability.
    pub fn into_ram(self) -> Option<RamCap> {
        match self {
            Self::Ram(ram) => Some(ram),
            _ => None,
        }
    }

    /// Returns the device object if this is a device capability.
    pub fn into_device(self) -> Option<DeviceCap> {
        match self {
            Self::Device(dev) => Some(dev),
            _ => None,
        }
    }
}

impl From<Frame> for Capability {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl From<EndpointCap> for Capability {
    fn from(ep: EndpointCap) -> Self {
        Self::Endpoint(ep)
    }
}

impl From<RamCap> for Capability {
    fn from(ram: RamCap) -> Self {
        Self::Ram(ram)
    }
}

impl From<DeviceCap> for Capability {
    fn from(dev: DeviceCap) -> Self {
        Self::Device(dev)
    }
}
