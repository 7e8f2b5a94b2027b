use crate::device::GpuDevice;

use super::{
    flags::BufferFlags,
    host::{HostData, HostDataUsed, NoHostData},
    readback::{
        CounterReadback, CounterReadbackUsed, DataReadback, DataReadbackUsed, NoCounterReadback,
        NoDataReadback,
    },
};

/// Compile-time bundle of device flags and the strategies a resource carries.
///
/// Capabilities a policy leaves out are backed by no-op strategies that panic
/// when used, so a misconfigured resource fails loudly instead of silently
/// skipping work.
pub trait BufferPolicy: 'static {
    const NAME: &'static str;
    const FLAGS: BufferFlags;

    type CounterReadback<D: GpuDevice>: CounterReadback<D>;
    type DataReadback<D: GpuDevice>: DataReadback<D>;
    type HostData: HostData;
}

/// Structured buffer a compute shader reads and writes.
pub struct ReadWrite;

impl BufferPolicy for ReadWrite {
    const NAME: &'static str = "read-write";
    const FLAGS: BufferFlags = BufferFlags::STRUCTURED
        .union(BufferFlags::BIND_SRV)
        .union(BufferFlags::BIND_UAV);

    type CounterReadback<D: GpuDevice> = NoCounterReadback;
    type DataReadback<D: GpuDevice> = NoDataReadback;
    type HostData = NoHostData;
}

/// Read-write structured buffer whose contents can be copied back to the host.
pub struct ReadWriteReadback;

impl BufferPolicy for ReadWriteReadback {
    const NAME: &'static str = "read-write-readback";
    const FLAGS: BufferFlags = BufferFlags::STRUCTURED
        .union(BufferFlags::BIND_SRV)
        .union(BufferFlags::BIND_UAV)
        .union(BufferFlags::UAV_OVERLAP);

    type CounterReadback<D: GpuDevice> = NoCounterReadback;
    type DataReadback<D: GpuDevice> = DataReadbackUsed<D>;
    type HostData = NoHostData;
}

/// Append/consume buffer whose counter can be copied back to the host.
pub struct ReadWriteAppend;

impl BufferPolicy for ReadWriteAppend {
    const NAME: &'static str = "read-write-append";
    const FLAGS: BufferFlags = BufferFlags::STRUCTURED
        .union(BufferFlags::BIND_SRV)
        .union(BufferFlags::BIND_UAV)
        .union(BufferFlags::UAV_COUNTER);

    type CounterReadback<D: GpuDevice> = CounterReadbackUsed<D>;
    type DataReadback<D: GpuDevice> = NoDataReadback;
    type HostData = NoHostData;
}

/// Structured buffer filled from a host mirror.
pub struct Dynamic;

impl BufferPolicy for Dynamic {
    const NAME: &'static str = "dynamic";
    const FLAGS: BufferFlags = BufferFlags::STRUCTURED
        .union(BufferFlags::BIND_SRV)
        .union(BufferFlags::DYNAMIC);

    type CounterReadback<D: GpuDevice> = NoCounterReadback;
    type DataReadback<D: GpuDevice> = NoDataReadback;
    type HostData = HostDataUsed;
}

/// Typed (formatted) buffer filled from a host mirror.
pub struct DynamicTyped;

impl BufferPolicy for DynamicTyped {
    const NAME: &'static str = "dynamic-typed";
    const FLAGS: BufferFlags = BufferFlags::BIND_SRV.union(BufferFlags::DYNAMIC);

    type CounterReadback<D: GpuDevice> = NoCounterReadback;
    type DataReadback<D: GpuDevice> = NoDataReadback;
    type HostData = HostDataUsed;
}

/// Typed (formatted) buffer a compute shader reads and writes.
pub struct ReadWriteTyped;

impl BufferPolicy for ReadWriteTyped {
    const NAME: &'static str = "read-write-typed";
    const FLAGS: BufferFlags = BufferFlags::BIND_SRV.union(BufferFlags::BIND_UAV);

    type CounterReadback<D: GpuDevice> = NoCounterReadback;
    type DataReadback<D: GpuDevice> = NoDataReadback;
    type HostData = NoHostData;
}
