/// Reflashing a puck through the external Espruino command line tool
use async_trait::async_trait;
use bluer::Address;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::error::FlashError;

const FLASH_TIMEOUT_SECS: u64 = 120;

/// Something that can push the puck script back onto a device
#[async_trait]
pub trait Flasher: Send + Sync {
    async fn flash(&self, mac: Address) -> Result<(), FlashError>;
}

/// Runs `<espruino> -p <mac> <script>` and waits for it to finish
#[derive(Debug, Clone)]
pub struct EspruinoFlasher {
    tool: PathBuf,
    script: PathBuf,
}

impl EspruinoFlasher {
    pub fn new(tool: PathBuf, script: PathBuf) -> Self {
        EspruinoFlasher { tool, script }
    }

    fn args(&self, mac: Address) -> Vec<String> {
        vec![
            "-p".to_string(),
            mac.to_string(),
            self.script.display().to_string(),
        ]
    }

    fn command_line(&self, mac: Address) -> String {
        let mut parts = vec![self.tool.display().to_string()];
        parts.extend(self.args(mac));
        parts.join(" ")
    }
}

#[async_trait]
impl Flasher for EspruinoFlasher {
    async fn flash(&self, mac: Address) -> Result<(), FlashError> {
        let command = self.command_line(mac);
        info!("Reprogramming puck {}: {}", mac, command);

        let mut child = Command::new(&self.tool);
        child.args(self.args(mac)).kill_on_drop(true);
        let run = child.output();
        let output = match tokio::time::timeout(Duration::from_secs(FLASH_TIMEOUT_SECS), run).await {
            Ok(result) => result.map_err(|source| FlashError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(FlashError::ExitStatus {
                    command,
                    status: format!("timeout after {}s", FLASH_TIMEOUT_SECS),
                    output: String::new(),
                })
            }
        };

        if output.status.success() {
            info!("Puck {} reprogrammed", mac);
            return Ok(());
        }

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(FlashError::ExitStatus {
            command,
            status: output.status.to_string(),
            output: captured.trim().to_string(),
        })
    }
}
