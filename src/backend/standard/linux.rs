//! Linux device-node I/O
//!
//! Video interfaces are enumerated and controlled through V4L2 and UVC
//! ioctls and streamed through `v4l` memory-mapped buffers. The command
//! interface uses usbfs bulk transfers, and HID interfaces use hidraw
//! reads and writes.

use crate::backend::cancel::{run_cancellable, CancelToken};
use crate::backend::{FrameCallback, HidCallback, HidDevice, UsbDevice, VideoDevice};
use crate::error::{BackendError, Result};
use crate::types::{
    Frame, HidInterfaceInfo, HidSample, HidSensor, PowerState, StreamProfile, UsbInterfaceInfo,
    VideoInterfaceInfo, XuControl,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

// ==================== ioctl numbers ====================

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioctl_code(direction: u32, kind: u8, nr: u8, size: usize) -> libc::c_ulong {
    ((direction << IOC_DIRSHIFT)
        | ((kind as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as libc::c_ulong
}

const fn iowr<T>(kind: u8, nr: u8) -> libc::c_ulong {
    ioctl_code(IOC_READ | IOC_WRITE, kind, nr, std::mem::size_of::<T>())
}

const fn ior<T>(kind: u8, nr: u8) -> libc::c_ulong {
    ioctl_code(IOC_READ, kind, nr, std::mem::size_of::<T>())
}

const VIDIOC_QUERYCAP: libc::c_ulong = ior::<V4l2Capability>(b'V', 0);
const VIDIOC_ENUM_FMT: libc::c_ulong = iowr::<V4l2FmtDesc>(b'V', 2);
const VIDIOC_G_CTRL: libc::c_ulong = iowr::<V4l2Control>(b'V', 27);
const VIDIOC_S_CTRL: libc::c_ulong = iowr::<V4l2Control>(b'V', 28);
const VIDIOC_ENUM_FRAMESIZES: libc::c_ulong = iowr::<V4l2FrmSizeEnum>(b'V', 74);
const VIDIOC_ENUM_FRAMEINTERVALS: libc::c_ulong = iowr::<V4l2FrmIvalEnum>(b'V', 75);
const UVCIOC_CTRL_QUERY: libc::c_ulong = iowr::<UvcXuControlQuery>(b'u', 0x21);

const USBDEVFS_BULK: libc::c_ulong = iowr::<UsbdevfsBulkTransfer>(b'U', 2);
const USBDEVFS_CLAIMINTERFACE: libc::c_ulong = ior::<libc::c_uint>(b'U', 15);
const USBDEVFS_RELEASEINTERFACE: libc::c_ulong = ior::<libc::c_uint>(b'U', 16);

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_FRMSIZE_TYPE_DISCRETE: u32 = 1;
const V4L2_FRMIVAL_TYPE_DISCRETE: u32 = 1;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

/// Buffers queued to the driver while streaming
const STREAM_BUFFERS: u32 = 4;

const UVC_SET_CUR: u8 = 0x01;
const UVC_GET_CUR: u8 = 0x81;

/// Command endpoints of the camera's vendor interface
const HWM_ENDPOINT_OUT: u32 = 0x01;
const HWM_ENDPOINT_IN: u32 = 0x81;
const HWM_MAX_RESPONSE: usize = 1024;

const HID_REPORT_SIZE: usize = 64;

/// How often blocked readers re-check their stop flag
const POLL_SLICE_MS: libc::c_int = 100;

// ==================== kernel structures ====================

#[allow(dead_code)]
#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[allow(dead_code)]
#[repr(C)]
struct V4l2FmtDesc {
    index: u32,
    type_: u32,
    flags: u32,
    description: [u8; 32],
    pixelformat: u32,
    mbus_code: u32,
    reserved: [u32; 3],
}

#[allow(dead_code)]
#[repr(C)]
struct V4l2FrmSizeEnum {
    index: u32,
    pixel_format: u32,
    type_: u32,
    /// discrete: width, height; stepwise: six values
    size: [u32; 6],
    reserved: [u32; 2],
}

#[allow(dead_code)]
#[repr(C)]
struct V4l2FrmIvalEnum {
    index: u32,
    pixel_format: u32,
    width: u32,
    height: u32,
    type_: u32,
    /// discrete: numerator, denominator; stepwise: three fractions
    interval: [u32; 6],
    reserved: [u32; 2],
}

#[allow(dead_code)]
#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[allow(dead_code)]
#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    size: u16,
    data: *mut u8,
}

#[allow(dead_code)]
#[repr(C)]
struct UsbdevfsBulkTransfer {
    ep: libc::c_uint,
    len: libc::c_uint,
    timeout: libc::c_uint,
    data: *mut libc::c_void,
}

fn last_os_error(what: &str) -> BackendError {
    BackendError::from_io(std::io::Error::last_os_error(), what)
}

/// Issue an ioctl on `fd` with a pointer argument
///
/// # Safety
///
/// `arg` must point to a value of the layout `request` expects.
unsafe fn ioctl_ptr<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> libc::c_int {
    libc::ioctl(fd, request as _, arg)
}

/// Wait until `fd` is readable or the slice elapses
fn wait_readable(fd: RawFd) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a valid pollfd and the count is 1.
    let ready = unsafe { libc::poll(&mut pfd, 1, POLL_SLICE_MS) };
    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}

fn open_rw(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BackendError::from_io(e, path))
}

// ==================== Video ====================

/// Reject nodes that cannot capture through streaming I/O
///
/// `caps` is the device capability mask, or the physical device mask when
/// the driver reports no per-node caps.
fn check_capture_caps(caps: u32, path: &str) -> Result<()> {
    if caps & V4L2_CAP_VIDEO_CAPTURE == 0 {
        return Err(BackendError::Transport(format!(
            "{} is not a capture node",
            path
        )));
    }
    if caps & V4L2_CAP_STREAMING == 0 {
        return Err(BackendError::Transport(format!(
            "{} does not support streaming I/O",
            path
        )));
    }
    Ok(())
}

/// Bytes of a dequeued buffer that hold the frame
fn frame_bytes(buf: &[u8], bytesused: u32) -> &[u8] {
    match bytesused as usize {
        0 => buf,
        used => &buf[..used.min(buf.len())],
    }
}

/// Apply `profile` to a freshly opened streaming handle
fn configure_stream(dev: &Device, profile: &StreamProfile) -> Result<()> {
    let requested = Format::new(
        profile.width,
        profile.height,
        FourCC::new(&profile.format.to_le_bytes()),
    );
    let applied = dev.set_format(&requested)?;
    if applied.width != requested.width
        || applied.height != requested.height
        || applied.fourcc != requested.fourcc
    {
        return Err(BackendError::InvalidArgument(format!(
            "driver replaced {} with {}x{} {:?}",
            profile, applied.width, applied.height, applied.fourcc
        )));
    }
    dev.set_params(&Parameters::with_fps(profile.fps))?;
    Ok(())
}

/// Stream `profile` from `path` until `stop` is raised or the handle closes
///
/// The outcome of setup and of the first dequeue is reported on `ready`
/// before any frame reaches the callback.
fn capture_loop(
    path: &str,
    profile: StreamProfile,
    stop: &AtomicBool,
    token: &CancelToken,
    callback: &FrameCallback,
    ready: crossbeam_channel::Sender<Result<()>>,
) {
    let opened = Device::with_path(path)
        .map_err(|e| BackendError::from_io(e, path))
        .and_then(|dev| configure_stream(&dev, &profile).map(|_| dev));
    let dev = match opened {
        Ok(dev) => dev,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = match MmapStream::with_buffers(&dev, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(BackendError::from_io(e, path)));
            return;
        }
    };
    stream.set_timeout(Duration::from_millis(POLL_SLICE_MS as u64));

    // The first dequeue issues STREAMON; its failure belongs to the caller
    let mut ready = Some(ready);
    let start = Instant::now();
    let mut delivered = 0u64;
    while !stop.load(Ordering::SeqCst) && !token.is_cancelled() {
        match stream.next() {
            Ok((buf, meta)) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                callback(Frame {
                    profile,
                    sequence: meta.sequence as u64,
                    timestamp_us: start.elapsed().as_micros() as u64,
                    data: frame_bytes(buf, meta.bytesused).to_vec(),
                });
                delivered += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(BackendError::from_io(e, path)));
                    }
                    None => warn!("Stream on {} failed: {}", path, e),
                }
                break;
            }
        }
    }
    debug!("Stream on {} ended after {} frames", path, delivered);
}

/// Capture thread of a streaming video node
struct StreamWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// V4L2 video node
pub struct LinuxVideoDevice {
    info: VideoInterfaceInfo,
    file: Arc<File>,
    token: Arc<CancelToken>,
    streaming: Mutex<Option<StreamWorker>>,
    power: Mutex<PowerState>,
}

impl LinuxVideoDevice {
    pub fn open(info: &VideoInterfaceInfo) -> Result<Self> {
        let file = open_rw(&info.device_path)?;

        let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
        // SAFETY: cap matches the VIDIOC_QUERYCAP layout.
        if unsafe { ioctl_ptr(file.as_raw_fd(), VIDIOC_QUERYCAP, &mut cap) } < 0 {
            return Err(last_os_error(&info.device_path));
        }
        let caps = if cap.device_caps != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        check_capture_caps(caps, &info.device_path)?;

        debug!("Opened video node {}", info.device_path);
        Ok(Self {
            info: info.clone(),
            file: Arc::new(file),
            token: Arc::new(CancelToken::new()),
            streaming: Mutex::new(None),
            power: Mutex::new(PowerState::D0),
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn frame_sizes(&self, pixel_format: u32) -> Vec<(u32, u32)> {
        let mut sizes = Vec::new();
        for index in 0.. {
            let mut desc: V4l2FrmSizeEnum = unsafe { std::mem::zeroed() };
            desc.index = index;
            desc.pixel_format = pixel_format;
            // SAFETY: desc matches the VIDIOC_ENUM_FRAMESIZES layout.
            if unsafe { ioctl_ptr(self.fd(), VIDIOC_ENUM_FRAMESIZES, &mut desc) } < 0 {
                break;
            }
            if desc.type_ != V4L2_FRMSIZE_TYPE_DISCRETE {
                break;
            }
            sizes.push((desc.size[0], desc.size[1]));
        }
        sizes
    }

    fn frame_rates(&self, pixel_format: u32, width: u32, height: u32) -> Vec<u32> {
        let mut rates = Vec::new();
        for index in 0.. {
            let mut desc: V4l2FrmIvalEnum = unsafe { std::mem::zeroed() };
            desc.index = index;
            desc.pixel_format = pixel_format;
            desc.width = width;
            desc.height = height;
            // SAFETY: desc matches the VIDIOC_ENUM_FRAMEINTERVALS layout.
            if unsafe { ioctl_ptr(self.fd(), VIDIOC_ENUM_FRAMEINTERVALS, &mut desc) } < 0 {
                break;
            }
            if desc.type_ != V4L2_FRMIVAL_TYPE_DISCRETE {
                break;
            }
            let (numerator, denominator) = (desc.interval[0], desc.interval[1]);
            if numerator != 0 {
                rates.push(denominator / numerator);
            }
        }
        rates
    }

    fn xu_query(&self, control: XuControl, query: u8, data: &mut [u8]) -> Result<()> {
        let size = u16::try_from(data.len()).map_err(|_| {
            BackendError::InvalidArgument(format!("XU payload of {} bytes", data.len()))
        })?;
        let mut request = UvcXuControlQuery {
            unit: control.unit,
            selector: control.selector,
            query,
            size,
            data: data.as_mut_ptr(),
        };
        // SAFETY: request.data points to `size` writable bytes for the duration of the call.
        if unsafe { ioctl_ptr(self.fd(), UVCIOC_CTRL_QUERY, &mut request) } < 0 {
            return Err(last_os_error(&self.info.device_path));
        }
        Ok(())
    }

    /// Stop the capture thread and wait for it to release its buffers
    fn halt_stream(&self) {
        let worker = match self.streaming.lock() {
            Ok(mut streaming) => streaming.take(),
            Err(_) => None,
        };
        let Some(worker) = worker else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        // A callback stopping its own stream cannot wait for itself
        if worker.thread.thread().id() != std::thread::current().id()
            && worker.thread.join().is_err()
        {
            warn!("Capture thread of {} panicked", self.info.id);
        }
    }
}

impl VideoDevice for LinuxVideoDevice {
    fn info(&self) -> &VideoInterfaceInfo {
        &self.info
    }

    fn profiles(&self) -> Result<Vec<StreamProfile>> {
        self.token.check()?;
        let mut profiles = Vec::new();
        for index in 0.. {
            let mut desc: V4l2FmtDesc = unsafe { std::mem::zeroed() };
            desc.index = index;
            desc.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            // SAFETY: desc matches the VIDIOC_ENUM_FMT layout.
            if unsafe { ioctl_ptr(self.fd(), VIDIOC_ENUM_FMT, &mut desc) } < 0 {
                break;
            }
            for (width, height) in self.frame_sizes(desc.pixelformat) {
                for fps in self.frame_rates(desc.pixelformat, width, height) {
                    profiles.push(StreamProfile::new(width, height, fps, desc.pixelformat));
                }
            }
        }
        trace!("{} exposes {} profiles", self.info.id, profiles.len());
        Ok(profiles)
    }

    fn start_streaming(&self, profile: StreamProfile, callback: FrameCallback) -> Result<()> {
        self.token.check()?;
        let mut streaming = self
            .streaming
            .lock()
            .map_err(|_| BackendError::Transport("stream state poisoned".to_string()))?;
        if streaming.is_some() {
            return Err(BackendError::AccessDenied(format!(
                "{} is already streaming",
                self.info.id
            )));
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let token = self.token.clone();
            let path = self.info.device_path.clone();
            std::thread::Builder::new()
                .name(format!("cambackend-{}", self.info.id))
                .spawn(move || capture_loop(&path, profile, &stop, &token, &callback, ready_tx))
                .map_err(BackendError::Io)?
        };

        let started = ready_rx.recv().unwrap_or_else(|_| {
            self.token.check().and(Err(BackendError::Transport(format!(
                "capture thread of {} exited during setup",
                self.info.id
            ))))
        });
        if let Err(e) = started {
            stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
            warn!("Cannot stream {} on {}: {}", profile, self.info.id, e);
            return Err(e);
        }

        *streaming = Some(StreamWorker { stop, thread });
        debug!("Streaming {} on {}", profile, self.info.id);
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        self.token.check()?;
        self.halt_stream();
        Ok(())
    }

    fn power_state(&self) -> Result<PowerState> {
        self.token.check()?;
        Ok(self.power.lock().map(|p| *p).unwrap_or_default())
    }

    fn set_power_state(&self, state: PowerState) -> Result<()> {
        self.token.check()?;
        if state == PowerState::D3 {
            self.halt_stream();
        }
        if let Ok(mut power) = self.power.lock() {
            *power = state;
        }
        Ok(())
    }

    fn get_xu(&self, control: XuControl, len: usize) -> Result<Vec<u8>> {
        self.token.check()?;
        let mut data = vec![0u8; len];
        self.xu_query(control, UVC_GET_CUR, &mut data)?;
        Ok(data)
    }

    fn set_xu(&self, control: XuControl, data: &[u8]) -> Result<()> {
        self.token.check()?;
        let mut payload = data.to_vec();
        self.xu_query(control, UVC_SET_CUR, &mut payload)
    }

    fn get_pu(&self, control: u32) -> Result<i32> {
        self.token.check()?;
        let mut ctrl = V4l2Control { id: control, value: 0 };
        // SAFETY: ctrl matches the VIDIOC_G_CTRL layout.
        if unsafe { ioctl_ptr(self.fd(), VIDIOC_G_CTRL, &mut ctrl) } < 0 {
            return Err(last_os_error(&self.info.device_path));
        }
        Ok(ctrl.value)
    }

    fn set_pu(&self, control: u32, value: i32) -> Result<()> {
        self.token.check()?;
        let mut ctrl = V4l2Control { id: control, value };
        // SAFETY: ctrl matches the VIDIOC_S_CTRL layout.
        if unsafe { ioctl_ptr(self.fd(), VIDIOC_S_CTRL, &mut ctrl) } < 0 {
            return Err(last_os_error(&self.info.device_path));
        }
        Ok(())
    }

    fn close(&self) {
        self.halt_stream();
        self.token.cancel();
    }
}

impl Drop for LinuxVideoDevice {
    fn drop(&mut self) {
        self.close();
    }
}

// ==================== USB ====================

/// usbfs handle on the camera's vendor command interface
pub struct LinuxUsbDevice {
    info: UsbInterfaceInfo,
    file: Arc<File>,
    token: CancelToken,
    claimed: AtomicBool,
}

fn bulk_transfer(fd: RawFd, endpoint: u32, data: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
    let mut transfer = UsbdevfsBulkTransfer {
        ep: endpoint,
        len: data.len() as libc::c_uint,
        timeout: timeout.as_millis().min(u32::MAX as u128) as libc::c_uint,
        data: data.as_mut_ptr().cast(),
    };
    // SAFETY: transfer.data points to `len` bytes that outlive the call.
    let n = unsafe { ioctl_ptr(fd, USBDEVFS_BULK, &mut transfer) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl LinuxUsbDevice {
    pub fn open(info: &UsbInterfaceInfo) -> Result<Self> {
        let file = open_rw(&info.device_path)?;
        let mut interface = info.interface_number as libc::c_uint;
        // SAFETY: interface is a valid c_uint for the duration of the call.
        if unsafe { ioctl_ptr(file.as_raw_fd(), USBDEVFS_CLAIMINTERFACE, &mut interface) } < 0 {
            return Err(last_os_error(&info.id));
        }
        debug!("Claimed USB interface {}", info.id);
        Ok(Self {
            info: info.clone(),
            file: Arc::new(file),
            token: CancelToken::new(),
            claimed: AtomicBool::new(true),
        })
    }

    fn release(&self) {
        if self.claimed.swap(false, Ordering::SeqCst) {
            let mut interface = self.info.interface_number as libc::c_uint;
            // SAFETY: interface is a valid c_uint for the duration of the call.
            if unsafe { ioctl_ptr(self.file.as_raw_fd(), USBDEVFS_RELEASEINTERFACE, &mut interface) } < 0 {
                trace!("Release of {} failed: {}", self.info.id, std::io::Error::last_os_error());
            }
        }
    }
}

impl UsbDevice for LinuxUsbDevice {
    fn info(&self) -> &UsbInterfaceInfo {
        &self.info
    }

    fn send_receive(
        &self,
        data: &[u8],
        timeout: Duration,
        require_response: bool,
    ) -> Result<Vec<u8>> {
        let file = self.file.clone();
        let mut request = data.to_vec();
        let id = self.info.id.clone();

        run_cancellable(&self.token, move || {
            let fd = file.as_raw_fd();
            bulk_transfer(fd, HWM_ENDPOINT_OUT, &mut request, timeout)
                .map_err(|e| BackendError::from_io(e, &id))?;
            if !require_response {
                return Ok(Vec::new());
            }
            let mut response = vec![0u8; HWM_MAX_RESPONSE];
            let n = bulk_transfer(fd, HWM_ENDPOINT_IN, &mut response, timeout)
                .map_err(|e| BackendError::from_io(e, &id))?;
            response.truncate(n);
            Ok(response)
        })
    }

    fn close(&self) {
        self.token.cancel();
        self.release();
    }
}

impl Drop for LinuxUsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

// ==================== HID ====================

/// hidraw node
pub struct LinuxHidDevice {
    info: HidInterfaceInfo,
    file: Mutex<File>,
    token: Arc<CancelToken>,
    capture: Mutex<Option<Arc<AtomicBool>>>,
}

impl LinuxHidDevice {
    pub fn open(info: &HidInterfaceInfo) -> Result<Self> {
        let file = open_rw(&info.device_path)?;
        debug!("Opened HID node {} ({})", info.device_path, info.sensor_name);
        Ok(Self {
            info: info.clone(),
            file: Mutex::new(file),
            token: Arc::new(CancelToken::new()),
            capture: Mutex::new(None),
        })
    }

    fn halt_capture(&self) {
        if let Ok(mut capture) = self.capture.lock() {
            if let Some(stop) = capture.take() {
                stop.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl HidDevice for LinuxHidDevice {
    fn info(&self) -> &HidInterfaceInfo {
        &self.info
    }

    fn sensors(&self) -> Result<Vec<HidSensor>> {
        self.token.check()?;
        Ok(vec![HidSensor {
            name: self.info.sensor_name.clone(),
        }])
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        self.token.check()?;
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| BackendError::Transport("capture state poisoned".to_string()))?;
        if capture.is_some() {
            return Err(BackendError::AccessDenied(format!(
                "{} is already capturing",
                self.info.id
            )));
        }

        let mut reader = self
            .file
            .lock()
            .map_err(|_| BackendError::Transport("HID node poisoned".to_string()))?
            .try_clone()
            .map_err(|e| BackendError::from_io(e, &self.info.device_path))?;
        let stop = Arc::new(AtomicBool::new(false));
        *capture = Some(stop.clone());
        let token = self.token.clone();
        let sensor = self.info.sensor_name.clone();
        let id = self.info.id.clone();

        std::thread::Builder::new()
            .name(format!("cambackend-{}", id))
            .spawn(move || {
                let start = Instant::now();
                let mut report = [0u8; HID_REPORT_SIZE];
                let mut sequence = 0u64;
                while !stop.load(Ordering::SeqCst) && !token.is_cancelled() {
                    match wait_readable(reader.as_raw_fd()) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(e) => {
                            warn!("Capture on {} failed: {}", id, e);
                            break;
                        }
                    }
                    match reader.read(&mut report) {
                        Ok(0) => break,
                        Ok(n) => {
                            callback(HidSample {
                                sensor: sensor.clone(),
                                sequence,
                                timestamp_us: start.elapsed().as_micros() as u64,
                                data: report[..n].to_vec(),
                            });
                            sequence += 1;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!("Capture on {} failed: {}", id, e);
                            break;
                        }
                    }
                }
            })
            .map_err(BackendError::Io)?;
        Ok(())
    }

    fn stop_capture(&self) -> Result<()> {
        self.token.check()?;
        self.halt_capture();
        Ok(())
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        self.token.check()?;
        if data.is_empty() {
            return Err(BackendError::InvalidArgument("empty HID report".to_string()));
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| BackendError::Transport("HID node poisoned".to_string()))?;
        file.write_all(data)
            .map_err(|e| BackendError::from_io(e, &self.info.device_path))
    }

    fn close(&self) {
        self.halt_capture();
        self.token.cancel();
    }
}

impl Drop for LinuxHidDevice {
    fn drop(&mut self) {
        self.close();
    }
}
