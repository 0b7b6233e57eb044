use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

/// Reads the gadget's UDC attribute to tell whether the car is plugged in.
///
/// The kernel leaves the attribute empty (or "none" on some images) while
/// the gadget is not bound to a controller. Any read error counts as
/// disconnected; link flaps are not retried.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    udc_path: PathBuf,
}

impl ConnectivityProbe {
    pub fn new<P: Into<PathBuf>>(udc_path: P) -> Self {
        Self {
            udc_path: udc_path.into(),
        }
    }

    pub fn udc_path(&self) -> &Path {
        &self.udc_path
    }

    pub fn state(&self) -> ConnectivityState {
        match std::fs::read_to_string(&self.udc_path) {
            Ok(raw) => Self::parse_udc(&raw),
            Err(e) => {
                log::debug!("UDC attribute {} unreadable: {e}", self.udc_path.display());
                ConnectivityState::Disconnected
            }
        }
    }

    pub fn is_target_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    pub fn parse_udc(raw: &str) -> ConnectivityState {
        match raw.trim() {
            "" | "none" => ConnectivityState::Disconnected,
            _ => ConnectivityState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udc_treats_empty_and_none_as_disconnected() {
        assert_eq!(ConnectivityProbe::parse_udc(""), ConnectivityState::Disconnected);
        assert_eq!(ConnectivityProbe::parse_udc("\n"), ConnectivityState::Disconnected);
        assert_eq!(ConnectivityProbe::parse_udc("none\n"), ConnectivityState::Disconnected);
        assert_eq!(
            ConnectivityProbe::parse_udc("fe980000.usb\n"),
            ConnectivityState::Connected
        );
    }

    #[test]
    fn uppercase_none_is_a_controller_name() {
        // Only the literal lowercase value means unbound.
        assert_eq!(ConnectivityProbe::parse_udc("None"), ConnectivityState::Connected);
    }
}
