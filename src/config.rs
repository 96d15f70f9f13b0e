use crate::backend::kernels::KERNEL_SOURCE;
use crate::backend::DeviceType;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable forcing the serialization gate on (`1`, `true`, `yes`, `on`).
pub const ENV_FORCE_SERIALIZE: &str = "CLKIT_FORCE_SERIALIZE";
/// Environment variable naming a kernel source file to load instead of the embedded one.
pub const ENV_KERNEL_PATH: &str = "CLKIT_KERNEL_PATH";

/// Where `runtime::init` gets its kernel program from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// Source compiled into the binary.
    Embedded(&'static str),
    /// Source read from disk at init time.
    File(PathBuf),
    Inline(String),
}

impl KernelSource {
    pub fn load(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            KernelSource::Embedded(src) => src.as_bytes().to_vec(),
            KernelSource::Inline(src) => src.clone().into_bytes(),
            KernelSource::File(path) => std::fs::read(path)?,
        };

        if bytes.is_empty() {
            return Err(Error::InvalidSource);
        }
        Ok(bytes)
    }

    pub fn describe(&self) -> String {
        match self {
            KernelSource::Embedded(_) => "embedded kernel source".to_string(),
            KernelSource::Inline(_) => "inline kernel source".to_string(),
            KernelSource::File(path) => format!("kernel source file \"{}\"", path.display()),
        }
    }
}

impl Default for KernelSource {
    fn default() -> Self {
        KernelSource::Embedded(KERNEL_SOURCE)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Serialize backend calls regardless of the detected driver.
    pub force_serialize: bool,
    /// Substrings of the platform version string that switch the gate on.
    pub serialize_vendor_markers: Vec<String>,
    /// Device classes to try, in order, on each candidate platform.
    pub device_preference: Vec<DeviceType>,
    /// Try later platforms when the first has no usable device.
    pub scan_all_platforms: bool,
    /// Appended to the capability-derived program build options.
    pub build_options: Vec<String>,
    pub kernel_source: KernelSource,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            force_serialize: false,
            serialize_vendor_markers: vec!["AMD".to_string()],
            device_preference: vec![DeviceType::Gpu, DeviceType::Cpu],
            scan_all_platforms: false,
            build_options: vec!["-cl-std=CL1.2".to_string()],
            kernel_source: KernelSource::default(),
        }
    }
}

impl DeviceConfig {
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
    }

    /// Defaults overridden by [`ENV_FORCE_SERIALIZE`] and [`ENV_KERNEL_PATH`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_FORCE_SERIALIZE) {
            config.force_serialize = parse_flag(&value)
                .ok_or_else(|| Error::config(format!("{} must be a boolean, got {:?}", ENV_FORCE_SERIALIZE, value)))?;
        }

        if let Some(path) = std::env::var_os(ENV_KERNEL_PATH) {
            config.kernel_source = KernelSource::File(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_preference.is_empty() {
            return Err(Error::config("device_preference must name at least one device type"));
        }

        for (i, ty) in self.device_preference.iter().enumerate() {
            if self.device_preference[..i].contains(ty) {
                return Err(Error::config(format!("device type {} listed twice", ty)));
            }
        }

        if self.serialize_vendor_markers.iter().any(|m| m.is_empty()) {
            return Err(Error::config("serialize_vendor_markers must not contain empty strings"));
        }

        if self.build_options.iter().any(|o| o.trim().is_empty()) {
            return Err(Error::config("build_options must not contain empty entries"));
        }

        Ok(())
    }

    /// Whether a platform reporting `version` needs serialized access.
    pub fn wants_serialization(&self, version: &str) -> bool {
        self.force_serialize || self.serialize_vendor_markers.iter().any(|m| version.contains(m.as_str()))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DeviceConfig::default(),
        }
    }

    pub fn force_serialize(mut self, force: bool) -> Self {
        self.config.force_serialize = force;
        self
    }

    pub fn serialize_vendor_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.serialize_vendor_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn device_preference(mut self, preference: Vec<DeviceType>) -> Self {
        self.config.device_preference = preference;
        self
    }

    pub fn scan_all_platforms(mut self, scan: bool) -> Self {
        self.config.scan_all_platforms = scan;
        self
    }

    pub fn build_option<S: Into<String>>(mut self, option: S) -> Self {
        self.config.build_options.push(option.into());
        self
    }

    pub fn clear_build_options(mut self) -> Self {
        self.config.build_options.clear();
        self
    }

    pub fn kernel_source(mut self, source: KernelSource) -> Self {
        self.config.kernel_source = source;
        self
    }

    pub fn kernel_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.kernel_source = KernelSource::File(path.into());
        self
    }

    pub fn build(self) -> Result<DeviceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_preference, vec![DeviceType::Gpu, DeviceType::Cpu]);
        assert!(!config.force_serialize);
        assert!(!config.scan_all_platforms);
    }

    #[test]
    fn test_vendor_detection() {
        let config = DeviceConfig::default();
        assert!(config.wants_serialization("OpenCL 2.0 AMD-APP (3444.0)"));
        assert!(!config.wants_serialization("OpenCL 3.0 CUDA 12.2.148"));

        let forced = DeviceConfig::builder().force_serialize(true).build().unwrap();
        assert!(forced.wants_serialization("OpenCL 3.0 CUDA 12.2.148"));

        let custom = DeviceConfig::builder()
            .serialize_vendor_markers(["Intel"])
            .build()
            .unwrap();
        assert!(!custom.wants_serialization("OpenCL 2.0 AMD-APP"));
        assert!(custom.wants_serialization("OpenCL 3.0 Intel(R)"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(DeviceConfig::builder().device_preference(vec![]).build().is_err());
        assert!(DeviceConfig::builder()
            .device_preference(vec![DeviceType::Cpu, DeviceType::Cpu])
            .build()
            .is_err());
        assert!(DeviceConfig::builder().build_option("  ").build().is_err());
        assert!(DeviceConfig::builder().serialize_vendor_markers([""]).build().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_kernel_source_load() {
        assert!(!KernelSource::default().load().unwrap().is_empty());
        assert!(matches!(KernelSource::Inline(String::new()).load(), Err(Error::InvalidSource)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"__kernel void process_buffer() {}").unwrap();
        let loaded = KernelSource::File(file.path().to_path_buf()).load().unwrap();
        assert_eq!(loaded, b"__kernel void process_buffer() {}");

        let missing = KernelSource::File(PathBuf::from("/nonexistent/clkit/kernels.cl")).load();
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
