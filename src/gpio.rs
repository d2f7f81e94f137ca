use crate::error::CameraError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// 门继电器引脚
#[async_trait]
pub trait DoorPin: Send + Sync + 'static {
    /// 拉高 `duration` 后拉低，返回时脉冲已结束
    async fn pulse(&self, duration: Duration) -> Result<(), CameraError>;
}

/// Linux sysfs GPIO 输出引脚
pub struct SysfsPin {
    pin: u32,
    root: PathBuf,
}

impl SysfsPin {
    /// 导出引脚并设置为输出、低电平
    pub async fn open(root: impl Into<PathBuf>, pin: u32) -> Result<Self, CameraError> {
        let gpio = Self {
            pin,
            root: root.into(),
        };

        if !gpio.pin_dir().exists() {
            fs::write(gpio.root.join("export"), pin.to_string())
                .await
                .map_err(|e| CameraError::Gpio(format!("export gpio{}: {}", pin, e)))?;
        }
        fs::write(gpio.pin_dir().join("direction"), "out")
            .await
            .map_err(|e| CameraError::Gpio(format!("gpio{} direction: {}", pin, e)))?;
        gpio.write(false).await?;

        info!("GPIO {} opened as output.", pin);
        Ok(gpio)
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    async fn write(&self, high: bool) -> Result<(), CameraError> {
        let level = if high { "1" } else { "0" };
        fs::write(self.pin_dir().join("value"), level)
            .await
            .map_err(|e| CameraError::Gpio(format!("gpio{} value: {}", self.pin, e)))
    }
}

#[async_trait]
impl DoorPin for SysfsPin {
    async fn pulse(&self, duration: Duration) -> Result<(), CameraError> {
        debug!("GPIO {} high for {}ms", self.pin, duration.as_millis());
        self.write(true).await?;
        tokio::time::sleep(duration).await;
        self.write(false).await
    }
}
