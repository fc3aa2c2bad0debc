/// Preparing Bluetooth adapters through BlueZ before raw scanning starts
use log::{debug, error, info, warn};

/// Adapter name BlueZ uses for an HCI interface index
pub fn adapter_name(interface: u16) -> String {
    format!("hci{}", interface)
}

/// Make sure every configured adapter is powered on
///
/// Raw HCI scanning cannot power a controller itself, so this asks BlueZ to do
/// it. Individual adapters that are missing or refuse are logged and skipped.
///
/// # Arguments
/// * `interfaces` - HCI interface indexes from the configuration
///
/// # Returns
/// Number of adapters found powered, or an error if no BlueZ session is available
pub async fn power_on_adapters(interfaces: &[u16]) -> Result<usize, bluer::Error> {
    // Initialize Bluetooth session
    let session = match bluer::Session::new().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create Bluetooth session: {}", e);
            return Err(e);
        }
    };

    let mut powered = 0;
    for &interface in interfaces {
        let name = adapter_name(interface);
        let adapter = match session.adapter(&name) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Bluetooth adapter {} not available: {}", name, e);
                continue;
            }
        };

        match adapter.is_powered().await {
            Ok(true) => {
                debug!("Adapter {} already powered", name);
                powered += 1;
            }
            _ => match adapter.set_powered(true).await {
                Ok(()) => {
                    info!("Powered on adapter {}", name);
                    powered += 1;
                }
                Err(e) => warn!("Failed to power on adapter {}: {}", name, e),
            },
        }
    }

    Ok(powered)
}
