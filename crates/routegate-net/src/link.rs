//! Dummy-link and address management over rtnetlink.

use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::Handle;
use tracing::{debug, info};

use crate::NetSetupError;

const ENODEV: i32 = -19;

/// Look up the interface index for `name`, or `None` if no such link
/// exists.
async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>, NetSetupError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(rtnetlink::Error::NetlinkError(err)) if err.raw_code() == ENODEV => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Make sure a dummy link named `name` exists, returning its index.
pub(crate) async fn ensure_service_device(
    handle: &Handle,
    name: &str,
) -> Result<u32, NetSetupError> {
    if let Some(index) = link_index(handle, name).await? {
        debug!(device = name, index, "service device already present");
        return Ok(index);
    }

    handle
        .link()
        .add()
        .dummy(name.to_string())
        .execute()
        .await?;
    info!(device = name, "created service device");

    match link_index(handle, name).await? {
        Some(index) => Ok(index),
        None => Err(NetSetupError::Parse(format!(
            "device {name} missing after create"
        ))),
    }
}

/// Bring the link administratively up. A no-op when it already is.
pub(crate) async fn ensure_device_up(handle: &Handle, index: u32) -> Result<(), NetSetupError> {
    handle.link().set(index).up().execute().await?;
    Ok(())
}

/// Remove every IPv4 address bound to the link.
pub(crate) async fn flush_ipv4_addresses(
    handle: &Handle,
    index: u32,
) -> Result<(), NetSetupError> {
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(msg) = addrs.try_next().await? {
        let v4 = msg.attributes.iter().any(|attr| {
            matches!(attr, AddressAttribute::Address(IpAddr::V4(_)))
        });
        if !v4 {
            continue;
        }
        debug!(index, "removing stale address");
        handle.address().del(msg).execute().await?;
    }
    Ok(())
}

/// Bind `addr/prefix` to the link.
pub(crate) async fn add_address(
    handle: &Handle,
    index: u32,
    addr: Ipv4Addr,
    prefix: u8,
) -> Result<(), NetSetupError> {
    handle
        .address()
        .add(index, IpAddr::V4(addr), prefix)
        .execute()
        .await?;
    info!(index, address = %addr, prefix_length = prefix, "bound service address");
    Ok(())
}

/// Current IPv4 addresses on the link. Used by setup verification.
#[allow(dead_code)]
pub(crate) async fn ipv4_addresses(
    handle: &Handle,
    index: u32,
) -> Result<Vec<Ipv4Addr>, NetSetupError> {
    let mut out = Vec::new();
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(msg) = addrs.try_next().await? {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(IpAddr::V4(v4)) = attr {
                out.push(*v4);
            }
        }
    }
    Ok(out)
}
