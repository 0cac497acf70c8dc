//! Kernel interface of the i915 driver: the perf OA stream ioctl, topology
//! queries and the sysfs files describing a DRM device.

use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::errno::Errno;
use oa::{DeviceInfo, OaFormat};

use crate::StreamError;

const DRM_IOCTL_BASE: u8 = b'd';
const DRM_COMMAND_BASE: u8 = 0x40;
const DRM_I915_GETPARAM: u8 = 0x06;
const DRM_I915_PERF_OPEN: u8 = 0x36;

const I915_PERF_FLAG_FD_CLOEXEC: u32 = 1 << 0;
const I915_PERF_FLAG_FD_NONBLOCK: u32 = 1 << 1;

const DRM_I915_PERF_PROP_CTX_HANDLE: u64 = 1;
const DRM_I915_PERF_PROP_SAMPLE_OA: u64 = 2;
const DRM_I915_PERF_PROP_OA_METRICS_SET: u64 = 3;
const DRM_I915_PERF_PROP_OA_FORMAT: u64 = 4;
const DRM_I915_PERF_PROP_OA_EXPONENT: u64 = 5;

const I915_PARAM_EU_TOTAL: i32 = 34;
const I915_PARAM_SLICE_MASK: i32 = 46;
const I915_PARAM_SUBSLICE_MASK: i32 = 47;

const INTEL_VENDOR_ID: u64 = 0x8086;

/// Argument of `DRM_IOCTL_I915_PERF_OPEN`
#[repr(C)]
#[derive(Debug, Default)]
pub struct PerfOpenParam {
    pub flags: u32,
    pub num_properties: u32,
    /// Pointer to `num_properties` (id, value) pairs of u64
    pub properties_ptr: u64,
}

/// Argument of `DRM_IOCTL_I915_GETPARAM`
#[repr(C)]
#[derive(Debug)]
pub struct GetParam {
    pub param: i32,
    pub value: *mut i32,
}

nix::ioctl_write_ptr!(
    i915_perf_open,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_I915_PERF_OPEN,
    PerfOpenParam
);
nix::ioctl_readwrite!(
    i915_getparam,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_I915_GETPARAM,
    GetParam
);

/// A GPU context handle the OA unit can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxHandle {
    pub id: u32,
    /// DRM file the context was created on; the stream must be opened on it
    pub fd: RawFd,
}

/// Parameters of an OA stream
#[derive(Debug, Clone, Copy)]
pub struct OaOpenRequest {
    pub metrics_set_id: u64,
    pub format: OaFormat,
    pub period_exponent: u32,
    pub ctx: Option<CtxHandle>,
}

// Retries an ioctl interrupted by a signal or asked to try again
fn retry_ioctl(mut f: impl FnMut() -> nix::Result<libc::c_int>) -> nix::Result<libc::c_int> {
    loop {
        match f() {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            other => return other,
        }
    }
}

/// Opens an i915 perf stream sampling OA reports
pub fn open_oa_stream(drm_fd: RawFd, request: &OaOpenRequest) -> Result<OwnedFd, StreamError> {
    let mut properties = vec![
        DRM_I915_PERF_PROP_SAMPLE_OA,
        1,
        DRM_I915_PERF_PROP_OA_METRICS_SET,
        request.metrics_set_id,
        DRM_I915_PERF_PROP_OA_FORMAT,
        request.format.kernel_id(),
        DRM_I915_PERF_PROP_OA_EXPONENT,
        u64::from(request.period_exponent),
    ];

    let mut fd = drm_fd;
    if let Some(ctx) = request.ctx {
        debug!("opening i915 perf stream for ctx {}", ctx.id);
        properties.extend([DRM_I915_PERF_PROP_CTX_HANDLE, u64::from(ctx.id)]);
        fd = ctx.fd;
    }

    let param = PerfOpenParam {
        flags: I915_PERF_FLAG_FD_CLOEXEC | I915_PERF_FLAG_FD_NONBLOCK,
        num_properties: (properties.len() / 2) as u32,
        properties_ptr: properties.as_ptr() as u64,
    };

    // Safety: `param` and the properties it points to outlive the call
    let stream_fd = retry_ioctl(|| unsafe { i915_perf_open(fd, &param) })
        .map_err(|e| StreamError::OaOpen(e.into()))?;

    // Safety: the kernel handed us a new descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(stream_fd) })
}

/// Reads one i915 parameter
pub fn get_param(drm_fd: RawFd, param: i32) -> Result<i32, StreamError> {
    let mut value = 0i32;
    let mut arg = GetParam {
        param,
        value: &mut value,
    };
    // Safety: `arg` points at `value`, both live across the call
    retry_ioctl(|| unsafe { i915_getparam(drm_fd, &mut arg) })
        .map_err(|e| StreamError::Io(e.into()))?;
    Ok(value)
}

/// An opened i915 render node
pub struct DrmDevice {
    file: File,
    render_node: u32,
    card: u32,
    devid: u32,
}

impl DrmDevice {
    /// Opens the first Intel render node
    pub fn open() -> Result<Self, StreamError> {
        let render_node = find_intel_render_node(Path::new("/sys/class/drm")).ok_or(StreamError::NoRenderNode)?;
        let path = format!("/dev/dri/renderD{}", render_node);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let devid = read_sysfs_u64(&device_param_path(
            Path::new("/sys/class/drm"),
            &format!("renderD{}", render_node),
            "device",
        ))? as u32;
        let card = card_for_file(&file)?;

        info!("opened {} (card{}, devid {:#x})", path, card, devid);
        Ok(Self {
            file,
            render_node,
            card,
            devid,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn render_node(&self) -> u32 {
        self.render_node
    }

    pub fn card(&self) -> u32 {
        self.card
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }

    /// `/sys/class/drm/cardN`
    pub fn sysfs_dir(&self) -> PathBuf {
        PathBuf::from(format!("/sys/class/drm/card{}", self.card))
    }

    /// Queries the EU topology and frequency range
    pub fn device_info(&self) -> Result<DeviceInfo, StreamError> {
        let n_eus = get_param(self.fd(), I915_PARAM_EU_TOTAL)?;
        let slice_mask = get_param(self.fd(), I915_PARAM_SLICE_MASK)?;
        let subslice_mask = get_param(self.fd(), I915_PARAM_SUBSLICE_MASK)?;

        let dir = self.sysfs_dir();
        let gt_min = read_sysfs_u64(&dir.join("gt_min_freq_mhz"))?;
        let gt_max = read_sysfs_u64(&dir.join("gt_max_freq_mhz"))?;

        // Only the EU topology is queried; the generation is not needed by
        // the built-in formulas
        Ok(DeviceInfo::from_topology(
            self.devid,
            0,
            n_eus as u64,
            slice_mask as u64,
            subslice_mask as u64,
            gt_min,
            gt_max,
        ))
    }
}

fn device_param_path(class_dir: &Path, node: &str, param: &str) -> PathBuf {
    class_dir.join(node).join("device").join(param)
}

/// Finds the first render node (`renderD128` to `renderD143`) of an Intel
/// device under a `/sys/class/drm`-like directory
pub fn find_intel_render_node(class_dir: &Path) -> Option<u32> {
    (128..144).find(|node| {
        let path = device_param_path(class_dir, &format!("renderD{}", node), "vendor");
        matches!(read_sysfs_u64(&path), Ok(INTEL_VENDOR_ID))
    })
}

/// Reads a sysfs value, decimal or `0x`-prefixed hexadecimal
pub fn read_sysfs_u64(path: &Path) -> Result<u64, StreamError> {
    let text = fs::read_to_string(path)?;
    parse_u64(text.trim()).ok_or_else(|| StreamError::Parse {
        path: path.display().to_string(),
        value: text.trim().to_string(),
    })
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

// Device numbers as glibc encodes them
fn major(rdev: u64) -> u64 {
    ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)
}

fn minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xff)
}

// Index of the primary node sharing a device with the opened node
fn card_for_file(file: &File) -> Result<u32, StreamError> {
    let rdev = file.metadata()?.rdev();
    let dir = format!("/sys/dev/char/{}:{}/device/drm", major(rdev), minor(rdev));
    card_in_dir(Path::new(&dir))
}

fn card_in_dir(dir: &Path) -> Result<u32, StreamError> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let card = name
            .to_str()
            .and_then(|name| name.strip_prefix("card"))
            .and_then(|index| index.parse().ok());
        if let Some(card) = card {
            return Ok(card);
        }
    }
    Err(StreamError::NoRenderNode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::env;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("streams-i915-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[rstest]
    #[case("0x8086", Some(0x8086))]
    #[case("1100", Some(1100))]
    #[case("0x", None)]
    #[case("abc", None)]
    fn test_parse_u64(#[case] value: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_u64(value), expected);
    }

    #[test]
    fn test_device_numbers() {
        // 226:128 is the first render node
        let rdev = (226u64 << 8) | 128;
        assert_eq!(major(rdev), 226);
        assert_eq!(minor(rdev), 128);
    }

    #[test]
    fn test_finds_intel_render_node() {
        let dir = scratch_dir("render");
        for (node, vendor) in [(128, "0x1002\n"), (129, "0x8086\n")] {
            let device = dir.join(format!("renderD{}", node)).join("device");
            fs::create_dir_all(&device).unwrap();
            fs::write(device.join("vendor"), vendor).unwrap();
        }

        assert_eq!(find_intel_render_node(&dir), Some(129));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_card_in_dir() {
        let dir = scratch_dir("card");
        fs::create_dir_all(dir.join("renderD128")).unwrap();
        fs::create_dir_all(dir.join("card1")).unwrap();

        assert_eq!(card_in_dir(&dir).unwrap(), 1);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_malformed_sysfs_value() {
        let dir = scratch_dir("parse");
        let path = dir.join("gt_max_freq_mhz");
        fs::write(&path, "fast\n").unwrap();

        assert!(matches!(
            read_sysfs_u64(&path),
            Err(StreamError::Parse { value, .. }) if value == "fast"
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
