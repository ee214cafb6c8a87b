//! Two bridges wired back-to-back.
//!
//! The `host` side always sends directly. The `page` side sends either
//! directly or through a [`SideBandSlot`], in which case the host must
//! acknowledge every inbound message; [`throttled_pair`] turns that on.

use std::rc::Rc;

use bridge::{Bridge, BridgeConfig, BridgeError, SchedulerRef, TransportSelection};
use tracing::debug;

use crate::{Mailbox, SideBandSlot};

/// How the page side reaches the host.
#[derive(Debug, Clone)]
pub enum PageLink {
    /// Unthrottled mailbox.
    Direct(Mailbox),
    /// Rate-limited side band.
    Throttled(SideBandSlot),
}

/// Two connected bridges and the primitives between them.
#[derive(Debug, Clone)]
pub struct LoopbackPair {
    /// The side that sends directly and acknowledges when throttled.
    pub host: Bridge,
    /// The side whose outbound adapter is selectable.
    pub page: Bridge,
    /// Host-to-page channel.
    pub to_page: Mailbox,
    /// Page-to-host channel.
    pub to_host: PageLink,
}

/// Connects two bridges through mailboxes in both directions.
pub fn direct_pair(
    scheduler: SchedulerRef,
    host_config: BridgeConfig,
    page_config: BridgeConfig,
) -> Result<LoopbackPair, BridgeError> {
    let to_page = Mailbox::new(scheduler.clone());
    let to_host = Mailbox::new(scheduler.clone());
    let host = Bridge::new(
        host_config,
        scheduler.clone(),
        TransportSelection::Direct(Box::new(to_page.clone())),
    )?;
    let page = Bridge::new(
        page_config,
        scheduler,
        TransportSelection::Direct(Box::new(to_host.clone())),
    )?;
    to_page.connect(&page);
    to_host.connect(&host);
    debug!("Connected direct loopback pair");
    Ok(LoopbackPair {
        host,
        page,
        to_page,
        to_host: PageLink::Direct(to_host),
    })
}

/// Connects the page through a [`SideBandSlot`] and the host through a
/// mailbox. The host configuration is forced to acknowledge inbound
/// messages.
pub fn throttled_pair(
    scheduler: SchedulerRef,
    host_config: BridgeConfig,
    page_config: BridgeConfig,
) -> Result<LoopbackPair, BridgeError> {
    let to_page = Mailbox::new(scheduler.clone());
    let to_host = SideBandSlot::new(scheduler.clone());
    let host = Bridge::new(
        BridgeConfig {
            acknowledge_inbound: true,
            ..host_config
        },
        scheduler.clone(),
        TransportSelection::Direct(Box::new(to_page.clone())),
    )?;
    let page = Bridge::new(
        page_config,
        scheduler,
        TransportSelection::Queued(Rc::new(to_host.clone())),
    )?;
    to_page.connect(&page);
    to_host.connect(&host);
    debug!("Connected throttled loopback pair");
    Ok(LoopbackPair {
        host,
        page,
        to_page,
        to_host: PageLink::Throttled(to_host),
    })
}
