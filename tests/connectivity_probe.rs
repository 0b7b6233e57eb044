use teslausb::network::{ConnectivityProbe, ConnectivityState};
use tempfile::TempDir;

#[test]
fn bound_udc_reports_connected() {
    let tmp = TempDir::new().expect("tempdir");
    let udc = tmp.path().join("UDC");
    std::fs::write(&udc, "fe980000.usb\n").expect("write UDC");

    let probe = ConnectivityProbe::new(&udc);
    assert_eq!(probe.state(), ConnectivityState::Connected);
    assert!(probe.is_target_connected());
}

#[test]
fn unbound_udc_reports_disconnected() {
    let tmp = TempDir::new().expect("tempdir");
    let udc = tmp.path().join("UDC");
    let probe = ConnectivityProbe::new(&udc);

    for raw in ["", "\n", "none", "none\n", "   "] {
        std::fs::write(&udc, raw).expect("write UDC");
        assert!(
            !probe.is_target_connected(),
            "expected {raw:?} to read as disconnected"
        );
    }
}

#[test]
fn missing_or_unreadable_attribute_is_disconnected_not_an_error() {
    let tmp = TempDir::new().expect("tempdir");

    let missing = ConnectivityProbe::new(tmp.path().join("no-such-gadget").join("UDC"));
    assert_eq!(missing.state(), ConnectivityState::Disconnected);

    // Reading a directory fails with EISDIR.
    let dir_probe = ConnectivityProbe::new(tmp.path());
    assert!(!dir_probe.is_target_connected());
}

#[test]
fn probe_follows_link_changes_without_caching() {
    let tmp = TempDir::new().expect("tempdir");
    let udc = tmp.path().join("UDC");
    let probe = ConnectivityProbe::new(&udc);

    std::fs::write(&udc, "fe980000.usb\n").expect("bind");
    assert!(probe.is_target_connected());
    std::fs::write(&udc, "\n").expect("unbind");
    assert!(!probe.is_target_connected());
}
