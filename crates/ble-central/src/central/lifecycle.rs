//! Connection lifecycle: connect, timeout, disconnect, shutdown

use super::Shared;
use crate::event::{ConnectionEvent, EventHandler, GattEvent};
use crate::registry::{Announce, BeginConnect};
use crate::routing::RouteKey;
use crate::transport::TransportHandle;
use crate::types::{PeerAddress, PeerInfo, PeerState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Shared {
    pub(super) fn connect(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        address: PeerAddress,
        handler: EventHandler,
    ) {
        if !self.transport.is_enabled() {
            warn!("Cannot connect to {}: Bluetooth radio is disabled", address);
            self.start_failed(&address, handler, "Bluetooth radio is disabled");
            return;
        }

        let handle = TransportHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let reservation = self.registry.begin_connect(&address, handle, || {
            self.routes.register_connection(&address, handler.clone())
        });
        let stale = match reservation {
            BeginConnect::Reserved { stale } => stale,
            BeginConnect::Busy(state) => {
                let reason = match state {
                    PeerState::Connected => "peer is already connected",
                    _ => "connection already in progress",
                };
                debug!("Rejecting connect to {}: {}", address, reason);
                self.start_failed(&address, handler, reason);
                return;
            }
        };

        if let Some(stale) = stale {
            debug!("Closing stale handle {} for {}", stale, address);
            self.transport.close(stale);
        }

        if !self.transport.connect(&address, handle) {
            warn!("Transport refused connection to {}", address);
            self.registry.remove_if_handle(&address, handle, || {
                self.routes.unregister(&RouteKey::Connection(address.clone()))
            });
            self.start_failed(&address, handler, "transport refused the connection request");
            return;
        }

        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| self.config.connect_timeout());
        info!(
            "Connecting to {} on handle {} (timeout {:?})",
            address, handle, timeout
        );
        // Lifecycle events for the handle are held back until this is queued
        self.report(
            handler.clone(),
            GattEvent::Connection {
                peer: self.peer_info(&address),
                event: ConnectionEvent::Started,
            },
        );

        let weak = Arc::downgrade(self);
        let expiring = address.clone();
        let timer = self.executor.post_delayed(
            timeout,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_connect_timeout(&expiring, handle);
                }
            }),
        );

        match self
            .registry
            .announce(&address, handle, timer, || self.routes.purge_peer(&address))
        {
            Announce::Pending => {}
            Announce::Connected => {
                self.executor.cancel(timer);
                info!("Connected to {}", address);
                self.report(
                    handler,
                    GattEvent::Connection {
                        peer: self.peer_info(&address),
                        event: ConnectionEvent::Connected,
                    },
                );
            }
            Announce::LinkLost { purged, .. } => {
                self.executor.cancel(timer);
                self.transport.close(handle);
                info!("Link to {} failed while connecting", address);
                if let Some(handler) = purged {
                    self.report(
                        handler,
                        GattEvent::Connection {
                            peer: PeerInfo::idle(address.clone()),
                            event: ConnectionEvent::Disconnected,
                        },
                    );
                }
            }
            Announce::Cancelled => {
                self.executor.cancel(timer);
                debug!("Attempt on {} ended before it was announced", address);
            }
        }
    }

    fn start_failed(&self, address: &PeerAddress, handler: EventHandler, reason: &str) {
        self.report(
            handler,
            GattEvent::Connection {
                peer: self.peer_info(address),
                event: ConnectionEvent::StartFailed(reason.to_string()),
            },
        );
    }

    /// Runs on the callback executor when an attempt's timer fires
    fn on_connect_timeout(&self, address: &PeerAddress, handle: TransportHandle) {
        let Some((_, handler)) = self
            .registry
            .expire(address, handle, || self.routes.purge_peer(address))
        else {
            debug!("Timeout for {} ignored, attempt already settled", address);
            return;
        };

        warn!("Connection to {} timed out", address);
        self.transport.close(handle);

        if let Some(handler) = handler {
            self.report(
                handler,
                GattEvent::Connection {
                    peer: PeerInfo::idle(address.clone()),
                    event: ConnectionEvent::TimedOut,
                },
            );
        }
    }

    pub(super) fn disconnect_peer(&self, address: &PeerAddress) {
        let Some((removed, handler)) = self
            .registry
            .remove_active(address, || self.routes.purge_peer(address))
        else {
            debug!("No active handle for {}, nothing to disconnect", address);
            return;
        };

        if let Some(timer) = removed.timer {
            self.executor.cancel(timer);
        }

        if let Some(handle) = removed.handle {
            self.transport.disconnect(handle);
            self.transport.close(handle);
        }

        // Cancelling an attempt that never connected reports nothing
        if !removed.state.is_connected() {
            info!("Cancelled pending connection to {}", address);
            return;
        }

        info!("Disconnected from {}", address);
        if let Some(handler) = handler {
            self.report(
                handler,
                GattEvent::Connection {
                    peer: PeerInfo::idle(address.clone()),
                    event: ConnectionEvent::Disconnected,
                },
            );
        }
    }

    pub(super) fn disconnect_all(&self) {
        let peers = self.registry.addresses_with_handle();
        debug!("Disconnecting {} peer(s)", peers.len());
        for address in peers {
            self.disconnect_peer(&address);
        }
    }

    pub(super) fn shutdown(&self) {
        self.executor.cancel_all();
        self.disconnect_all();
        self.routes.clear_all();

        for (address, removed) in self.registry.clear() {
            if let Some(handle) = removed.handle {
                debug!("Closing leftover handle {} for {}", handle, address);
                self.transport.close(handle);
            }
        }
        info!("GATT central shut down");
    }
}
