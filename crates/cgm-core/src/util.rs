//! Peripheral identity and name helpers shared by the radio backends.

use btleplug::platform::PeripheralId;

/// Address reported by backends that hide the real MAC (CoreBluetooth).
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap a MAC address or
/// a D-Bus path. The `PeripheralId(...)` wrapper is stripped.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_wrapper(&format!("{id:?}")).to_string()
}

fn strip_wrapper(debug: &str) -> &str {
    debug.trim_start_matches("PeripheralId(").trim_end_matches(')')
}

/// Stable identity for a peripheral: its address when the backend exposes
/// one, the platform ID otherwise.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    identity_or(address, || format_peripheral_id(peripheral_id))
}

fn identity_or(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}

/// Case-insensitive substring match of an advertised name.
///
/// Transmitters append serial digits to a fixed prefix (`BLU0001234`,
/// `miaomiao2`), and some users rename them, so only containment is checked.
#[must_use]
pub fn name_matches(advertised: &str, pattern: &str) -> bool {
    advertised.to_lowercase().contains(&pattern.to_lowercase())
}
