//! Uplink supervisor: owns Ethernet and Wi-Fi-STA connectivity, selects
//! the default route, and notifies dependents (MQTT client start/stop
//! gate). Losing the route never tears down the mesh, only the external
//! leg -- the mesh router is a separate component.

use crate::hw::PhyEvent;
use serde::Serialize;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UplinkKind {
    Ethernet,
    WifiSta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Ethernet,
    WiFi,
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UplinkState {
    pub link_up: bool,
    pub has_ip: bool,
    pub ip: Option<Ipv4Addr>,
}

impl UplinkState {
    pub fn connected(&self) -> bool {
        self.link_up && self.has_ip
    }

    fn apply(&mut self, event: PhyEvent) {
        match event {
            PhyEvent::LinkUp => self.link_up = true,
            PhyEvent::LinkDown => {
                self.link_up = false;
                self.has_ip = false;
                self.ip = None;
            }
            PhyEvent::GotIp(ip) => {
                self.has_ip = true;
                self.ip = Some(ip);
            }
            PhyEvent::LostIp => {
                self.has_ip = false;
                self.ip = None;
            }
        }
    }
}

pub struct UplinkSupervisor {
    ethernet: UplinkState,
    wifi: UplinkState,
    route: Route,
}

impl UplinkSupervisor {
    pub fn new() -> Self {
        UplinkSupervisor {
            ethernet: UplinkState::default(),
            wifi: UplinkState::default(),
            route: Route::None,
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn ethernet(&self) -> UplinkState {
        self.ethernet
    }

    pub fn wifi(&self) -> UplinkState {
        self.wifi
    }

    /// Applies a PHY event to the named uplink and recomputes the route.
    /// Returns `Some(new_route)` if the route changed (the caller fires
    /// `on_route_changed`), otherwise `None`.
    pub fn apply_event(&mut self, kind: UplinkKind, event: PhyEvent) -> Option<Route> {
        match kind {
            UplinkKind::Ethernet => self.ethernet.apply(event),
            UplinkKind::WifiSta => self.wifi.apply(event),
        }
        let new_route = Self::compute_route(self.ethernet.connected(), self.wifi.connected());
        if new_route != self.route {
            self.route = new_route;
            Some(new_route)
        } else {
            None
        }
    }

    pub fn compute_route(eth_connected: bool, wifi_connected: bool) -> Route {
        if eth_connected {
            Route::Ethernet
        } else if wifi_connected {
            Route::WiFi
        } else {
            Route::None
        }
    }
}

impl Default for UplinkSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_deterministic_from_connectivity_flags() {
        assert_eq!(UplinkSupervisor::compute_route(true, true), Route::Ethernet);
        assert_eq!(UplinkSupervisor::compute_route(true, false), Route::Ethernet);
        assert_eq!(UplinkSupervisor::compute_route(false, true), Route::WiFi);
        assert_eq!(UplinkSupervisor::compute_route(false, false), Route::None);
    }

    #[test]
    fn ethernet_takes_priority_over_wifi() {
        let mut sup = UplinkSupervisor::new();
        sup.apply_event(UplinkKind::WifiSta, PhyEvent::LinkUp);
        let changed = sup.apply_event(UplinkKind::WifiSta, PhyEvent::GotIp([10, 0, 0, 2].into()));
        assert_eq!(changed, Some(Route::WiFi));

        sup.apply_event(UplinkKind::Ethernet, PhyEvent::LinkUp);
        let changed = sup.apply_event(
            UplinkKind::Ethernet,
            PhyEvent::GotIp([10, 0, 0, 1].into()),
        );
        assert_eq!(changed, Some(Route::Ethernet));
        assert_eq!(sup.route(), Route::Ethernet);
    }

    #[test]
    fn losing_ip_on_active_route_falls_back_without_clearing_the_other_uplink() {
        let mut sup = UplinkSupervisor::new();
        sup.apply_event(UplinkKind::WifiSta, PhyEvent::LinkUp);
        sup.apply_event(UplinkKind::WifiSta, PhyEvent::GotIp([10, 0, 0, 2].into()));
        sup.apply_event(UplinkKind::Ethernet, PhyEvent::LinkUp);
        sup.apply_event(UplinkKind::Ethernet, PhyEvent::GotIp([10, 0, 0, 1].into()));
        assert_eq!(sup.route(), Route::Ethernet);

        let changed = sup.apply_event(UplinkKind::Ethernet, PhyEvent::LostIp);
        assert_eq!(changed, Some(Route::WiFi));
        assert!(sup.wifi().connected());
    }

    #[test]
    fn no_route_change_event_when_route_is_unaffected() {
        let mut sup = UplinkSupervisor::new();
        sup.apply_event(UplinkKind::Ethernet, PhyEvent::LinkUp);
        sup.apply_event(UplinkKind::Ethernet, PhyEvent::GotIp([10, 0, 0, 1].into()));
        // wifi coming up while ethernet already holds the route does not
        // fire a route-changed event.
        sup.apply_event(UplinkKind::WifiSta, PhyEvent::LinkUp);
        let changed = sup.apply_event(UplinkKind::WifiSta, PhyEvent::GotIp([10, 0, 0, 2].into()));
        assert_eq!(changed, None);
    }
}
