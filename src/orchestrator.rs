//! Top-level pipelines
//!
//! The orchestrator owns the transfer hub, the mount table, and the
//! operation queue, wires them according to `(role, mode, target)`,
//! and guarantees the shutdown handler (close sockets, release scratch
//! mounts) runs on every termination path before an error is re-raised.

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::{self, LiveProbe};
use crate::error::{Error, Result};
use crate::fs_driver;
use crate::image::{ImageHeader, ImageType, LabelKind, PartFlags, PartType, PartitionDesc};
use crate::link::LinkChain;
use crate::log::{RunLog, RunOutcome, RunRecord};
use crate::mounts::{Materializer, MountTable};
use crate::net::{self, MulticastReceiver, MulticastSender};
use crate::parted::{is_block_device, PartGeometry, PartitionTable, PlannedPartition, SysDisk};
use crate::progress::{OperationKind, OperationQueue, ProgressBridge, ProgressListener};
use crate::protocol::{DESC_LEN, HEADER_LEN, MULTICAST_GROUP, PORT_DATA, PORT_PING};
use crate::transfer::{CancelToken, TransferHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Unicast,
    Multicast,
    Link,
}

/// One requested run. Local mode needs both paths; network modes need
/// the one being sent or received into. When both are present the
/// device wins, matching the original tool's dispatch.
#[derive(Debug, Clone)]
pub struct Job {
    pub role: Role,
    pub mode: Mode,
    pub image: Option<PathBuf>,
    pub device: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct NetOptions {
    pub data_port: u16,
    pub ping_port: u16,
    pub group: Ipv4Addr,
    /// Unicast send: how many receivers to wait for.
    pub receivers: usize,
    /// Unicast send: stop accepting when this expires.
    pub accept_deadline: Option<Duration>,
    /// Unicast receive: the sender to connect to.
    pub sender: Option<IpAddr>,
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions {
            data_port: PORT_DATA,
            ping_port: PORT_PING,
            group: MULTICAST_GROUP.parse().expect("valid group literal"),
            receivers: 1,
            accept_deadline: None,
            sender: None,
        }
    }
}

pub struct Orchestrator {
    mounts: MountTable,
    queue: OperationQueue,
    listener: Arc<dyn ProgressListener>,
    hub: TransferHub,
    cancel: CancelToken,
    chain: Option<LinkChain>,
    run_log: Option<RunLog>,
}

impl Orchestrator {
    pub fn new(listener: Arc<dyn ProgressListener>, cancel: CancelToken) -> Self {
        let hub = TransferHub::new(cancel.clone(), Arc::new(ProgressBridge(listener.clone())));
        Orchestrator {
            mounts: MountTable::new(),
            queue: OperationQueue::new(listener.clone()),
            listener,
            hub,
            cancel,
            chain: None,
            run_log: None,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn transferred(&self) -> u64 {
        self.hub.transferred()
    }

    /// Journal finished runs to a JSONL file at `path`.
    pub fn set_run_log(&mut self, path: impl Into<PathBuf>) {
        self.run_log = Some(RunLog::new(path));
    }

    /// Run one job. Whatever happens, the shutdown handler closes all
    /// connections and the queue before this returns, and the run is
    /// journaled with its outcome.
    pub fn run(&mut self, job: &Job, opts: &NetOptions) -> Result<()> {
        let started = Instant::now();
        let result = self.dispatch(job, opts);
        self.shutdown();
        let result = match result {
            Err(e) if e.is_warning() => {
                self.listener.warning(&e.to_string());
                Ok(())
            }
            other => other,
        };
        self.journal(job, started, &result);
        result
    }

    /// Append the finished run to the journal, if one is configured.
    fn journal(&self, job: &Job, started: Instant, result: &Result<()>) {
        let Some(log) = &self.run_log else {
            return;
        };
        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(e) if e.is_cancel() => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        };
        let (source, destination) = job_endpoints(job);
        let record = RunRecord::finish(
            role_name(job.role),
            mode_name(job.mode),
            source,
            destination,
            outcome,
            self.hub.transferred(),
            started.elapsed().as_secs_f64(),
            result.as_ref().err().map(|e| e.to_string()),
        );
        if let Err(e) = log.append(&record) {
            self.listener.warning(&format!("run journal: {e}"));
        }
    }

    fn shutdown(&mut self) {
        self.hub.close();
        if let Some(mut chain) = self.chain.take() {
            chain.tear_down();
        }
        self.queue.clear();
    }

    fn dispatch(&mut self, job: &Job, opts: &NetOptions) -> Result<()> {
        match job.role {
            Role::Send => {
                self.wire_send(job.mode, opts)?;
                match (&job.device, &job.image) {
                    (Some(device), _) => self.send_device(device, job.mode != Mode::Local),
                    (None, Some(image)) if job.mode != Mode::Local => self.send_image_file(image),
                    _ => Err(Error::CreateImage(Some(
                        "nothing to send: no device or image given".into(),
                    ))),
                }
            }
            Role::Receive => {
                self.wire_receive(job.mode, opts)?;
                match (&job.device, &job.image) {
                    (Some(device), _) if job.mode != Mode::Local => {
                        self.receive_prelude()?;
                        self.restore_device(device)
                    }
                    (Some(device), Some(image)) => {
                        // Local restore: the image file is the source.
                        let file = File::open(image)
                            .map_err(|_| Error::FileNotFound(image.clone()))?;
                        let total = file
                            .metadata()
                            .map_err(|e| Error::ReadData(e.to_string()))?
                            .len();
                        self.hub.set_source(Box::new(file));
                        self.hub.set_total(total, false);
                        self.restore_device(device)
                    }
                    (None, Some(image)) if job.mode != Mode::Local => {
                        self.receive_image_file(image)
                    }
                    _ => Err(Error::RestoreImage(Some(
                        "nowhere to receive into: no device or image given".into(),
                    ))),
                }
            }
        }
    }

    /// Attach the sinks for a sending role.
    fn wire_send(&mut self, mode: Mode, opts: &NetOptions) -> Result<()> {
        match mode {
            Mode::Local => Ok(()), // the image file sink is attached by send paths
            Mode::Unicast => {
                self.queue.add(OperationKind::WaitClients, "");
                let peers =
                    net::accept_receivers(opts.data_port, opts.receivers, opts.accept_deadline)?;
                for (mut stream, addr) in peers {
                    net::handshake_server(&mut stream)?;
                    self.listener.new_connection(&addr.to_string());
                    self.hub.add_sink(addr.to_string(), Box::new(stream));
                }
                self.queue.mark_completed(OperationKind::WaitClients, "");
                Ok(())
            }
            Mode::Multicast => {
                let sink = MulticastSender::open(opts.group, opts.data_port)?;
                self.hub.add_sink("multicast", Box::new(sink));
                Ok(())
            }
            Mode::Link => {
                self.queue.add(OperationKind::WaitClients, "");
                let mut chain = LinkChain::head(opts.ping_port, opts.data_port, opts.group)?;
                if let Some(stream) = chain.downstream.take() {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "link".into());
                    self.listener.new_connection(&peer);
                    self.hub.add_sink(peer, Box::new(stream));
                }
                self.chain = Some(chain);
                self.queue.mark_completed(OperationKind::WaitClients, "");
                Ok(())
            }
        }
    }

    /// Attach the source (and relay sink, in chain mode) for a
    /// receiving role.
    fn wire_receive(&mut self, mode: Mode, opts: &NetOptions) -> Result<()> {
        match mode {
            Mode::Local => Ok(()),
            Mode::Unicast => {
                self.queue.add(OperationKind::WaitServer, "");
                let sender = opts
                    .sender
                    .ok_or_else(|| Error::Connection(Some("no sender address".into())))?;
                let stream = net::connect_to_sender(sender, opts.data_port)?;
                self.hub.set_source(Box::new(stream));
                self.queue.mark_completed(OperationKind::WaitServer, "");
                Ok(())
            }
            Mode::Multicast => {
                self.queue.add(OperationKind::WaitServer, "");
                let source = MulticastReceiver::join(opts.group, opts.data_port)?;
                self.hub.set_source(Box::new(source));
                self.queue.mark_completed(OperationKind::WaitServer, "");
                Ok(())
            }
            Mode::Link => {
                self.queue.add(OperationKind::WaitServer, "");
                let mut chain = LinkChain::join(opts.ping_port, opts.data_port, opts.group)?;
                if let Some(src) = chain.src_ip {
                    self.listener.new_connection(&src.to_string());
                }
                if let Some(upstream) = chain.upstream.take() {
                    self.hub.set_source(Box::new(upstream));
                }
                if let Some(downstream) = chain.downstream.take() {
                    let peer = downstream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "link".into());
                    self.hub.add_sink(peer, Box::new(downstream));
                }
                self.chain = Some(chain);
                self.queue.mark_completed(OperationKind::WaitServer, "");
                Ok(())
            }
        }
    }

    /// Local image ⇄ device entry points used by the CLI.
    pub fn create_image(&mut self, device: &Path, image: &Path) -> Result<()> {
        let job = Job {
            role: Role::Send,
            mode: Mode::Local,
            image: Some(image.to_path_buf()),
            device: Some(device.to_path_buf()),
        };
        let started = Instant::now();
        let result = File::create(image)
            .map_err(|_| Error::CreateImage(None))
            .and_then(|file| {
                self.hub.add_sink(image.display().to_string(), Box::new(file));
                self.dispatch(&job, &NetOptions::default())
            });
        self.shutdown();
        self.journal(&job, started, &result);
        result
    }

    pub fn restore_image(&mut self, image: &Path, device: &Path) -> Result<()> {
        let job = Job {
            role: Role::Receive,
            mode: Mode::Local,
            image: Some(image.to_path_buf()),
            device: Some(device.to_path_buf()),
        };
        self.run(&job, &NetOptions::default())
    }

    /// Send a pre-built image file without re-inspection.
    fn send_image_file(&mut self, image: &Path) -> Result<()> {
        let mut file = File::open(image).map_err(|_| Error::FileNotFound(image.to_path_buf()))?;
        let total = file
            .metadata()
            .map_err(|e| Error::ReadData(e.to_string()))?
            .len();
        self.hub.set_total(total, true);
        self.hub.transfer_from(&total.to_be_bytes())?;

        self.queue.add(OperationKind::TransferData, "");
        self.hub.transfer_all_from(&mut file)?;
        self.hub.flush_sinks()?;
        self.queue.mark_completed(OperationKind::TransferData, "");
        Ok(())
    }

    /// Inspect a device, spool its partition archives, and stream the
    /// complete image to the attached sinks.
    fn send_device(&mut self, device: &Path, network: bool) -> Result<()> {
        if !is_block_device(device) {
            return Err(Error::NoBlockDevice(device.to_path_buf()));
        }
        let disk = device::disk_path_of(device);
        let mut table = SysDisk::new(&disk)?;

        let target = disk.display().to_string();
        self.queue.add(OperationKind::ReadPartitionTable, &target);
        let part_num = device::partition_number(device);
        let (mut header, descs) = match part_num {
            None => device::inspect(&mut table, &self.mounts, &LiveProbe)?,
            Some(n) => device::inspect_partition(&mut table, &self.mounts, &LiveProbe, n)?,
        };
        self.queue
            .mark_completed(OperationKind::ReadPartitionTable, &target);

        table.open()?;
        let geoms: Vec<PartGeometry> = table
            .partitions()
            .into_iter()
            .filter(|g| part_num.is_none_or(|n| g.num == n))
            .collect();
        table.close();

        // Archive every data partition up front so the exact stream
        // length is known before the first wire byte.
        let mut spools: Vec<Option<(File, u64)>> = Vec::with_capacity(descs.len());
        let mut payload_total = 0u64;
        for (geom, desc) in geoms.iter().zip(&descs) {
            self.cancel.check()?;
            if desc.has_payload() {
                let driver = fs_driver::driver_for_tag(&desc.fs_tag);
                let mut mat =
                    Materializer::new(&self.mounts, driver, &geom.path, desc.uuid.clone());
                let (spool, len) = mat.read_to_spool()?;
                payload_total += 8 + len;
                spools.push(Some((spool, len)));
            } else {
                spools.push(None);
            }
        }
        header.image_size = payload_total;

        let total = (HEADER_LEN + DESC_LEN * descs.len()) as u64 + payload_total;
        self.hub.set_total(total, network);
        if network {
            self.hub.transfer_from(&total.to_be_bytes())?;
        }

        self.hub.transfer_from(&header.encode())?;
        self.hub.note_consumed(HEADER_LEN as u64);
        for desc in &descs {
            self.hub.transfer_from(&desc.encode())?;
            self.hub.note_consumed(DESC_LEN as u64);
        }

        self.queue.add(OperationKind::TransferData, &target);
        for spool in spools.into_iter().flatten() {
            let (mut file, len) = spool;
            self.hub.transfer_from(&len.to_be_bytes())?;
            self.hub.note_consumed(8);
            self.hub.transfer_all_from(&mut file)?;
        }
        self.hub.flush_sinks()?;
        self.queue.mark_completed(OperationKind::TransferData, &target);
        Ok(())
    }

    /// Read the 8-byte size prelude and arm the hub total.
    fn receive_prelude(&mut self) -> Result<()> {
        let mut prelude = [0u8; 8];
        self.hub.transfer_to(&mut prelude)?;
        let total = u64::from_be_bytes(prelude);
        self.hub.set_total(total, true);
        Ok(())
    }

    /// Receive the raw stream into an image file.
    fn receive_image_file(&mut self, image: &Path) -> Result<()> {
        let mut file = File::create(image).map_err(|_| Error::CreateImage(None))?;
        self.receive_prelude()?;
        self.queue.add(OperationKind::TransferData, "");
        self.hub.transfer_all_to(&mut file)?;
        self.queue.mark_completed(OperationKind::TransferData, "");
        Ok(())
    }

    /// Parse the stream from the hub source and rebuild the device:
    /// table, partition contents, flags, boot loader.
    fn restore_device(&mut self, device: &Path) -> Result<()> {
        if !is_block_device(device) {
            return Err(Error::NoBlockDevice(device.to_path_buf()));
        }

        let mut hbuf = [0u8; HEADER_LEN];
        self.hub.transfer_to(&mut hbuf)?;
        let header = ImageHeader::decode(&hbuf)?;
        self.hub.note_consumed(HEADER_LEN as u64);

        let mut descs = Vec::with_capacity(header.partition_count as usize);
        for _ in 0..header.partition_count {
            let mut dbuf = [0u8; DESC_LEN];
            self.hub.transfer_to(&mut dbuf)?;
            descs.push(PartitionDesc::decode(&dbuf)?);
            self.hub.note_consumed(DESC_LEN as u64);
        }

        let disk = device::disk_path_of(device);
        let mut table = SysDisk::new(&disk)?;
        table.open()?;
        let result = self.restore_open(&mut table, device, &header, &descs);
        table.close();
        result
    }

    fn restore_open(
        &mut self,
        table: &mut dyn PartitionTable,
        device: &Path,
        header: &ImageHeader,
        descs: &[PartitionDesc],
    ) -> Result<()> {
        let disk_target = table.disk_path().display().to_string();
        let dev_bytes = table.disk_length_sectors() * table.sector_size();
        for desc in descs {
            if !fits_in_device(desc, dev_bytes) {
                return Err(Error::RestoreImage(Some(format!(
                    "partition needs {} bytes but the target offers fewer",
                    desc.min_size
                ))));
            }
        }

        if header.image_type == ImageType::Disk {
            self.queue
                .add(OperationKind::WritePartitionTable, &disk_target);
            let planned = plan_partitions(descs, table.disk_length_sectors(), header.label_kind);
            table.write_table(header.label_kind, &planned)?;
            self.queue
                .mark_completed(OperationKind::WritePartitionTable, &disk_target);
        }

        let geoms: Vec<PartGeometry> = if header.image_type == ImageType::Disk {
            table.partitions()
        } else {
            let num = device::partition_number(device)
                .ok_or_else(|| Error::NoBlockDevice(device.to_path_buf()))?;
            vec![table.partition(num)?]
        };
        if geoms.len() < descs.len() {
            return Err(Error::RestoreImage(Some(
                "target exposes fewer partitions than the image describes".into(),
            )));
        }

        self.queue.add(OperationKind::TransferData, &disk_target);
        for (geom, desc) in geoms.iter().zip(descs) {
            self.cancel.check()?;
            if !desc.has_payload() {
                // Payload-free but formattable (swap): recreate the
                // signature, label, and UUID without mounting.
                let driver = fs_driver::driver_for_tag(&desc.fs_tag);
                if driver.format_command().is_some() {
                    driver.format(&geom.path)?;
                    driver.write_label(&geom.path, &desc.label)?;
                    driver.write_uuid(&geom.path, &desc.uuid)?;
                }
                continue;
            }
            let mut prefix = [0u8; 8];
            self.hub.transfer_to(&mut prefix)?;
            let len = u64::from_be_bytes(prefix);
            self.hub.note_consumed(8);

            let driver = fs_driver::driver_for_tag(&desc.fs_tag);
            let mut mat = Materializer::new(&self.mounts, driver, &geom.path, desc.uuid.clone());
            let mut reader = self.hub.source_reader(len);
            mat.restore_from(&mut reader, &desc.label, &desc.uuid)?;
            // The archive parser stops at the end marker; swallow any
            // remaining padding so the next prefix read stays aligned.
            io::copy(&mut reader, &mut io::sink())
                .map_err(|e| Error::ReceiveData(e.to_string()))?;
        }
        self.queue.mark_completed(OperationKind::TransferData, &disk_target);

        if header.image_type == ImageType::Disk {
            self.queue
                .add(OperationKind::WritePartitionFlags, &disk_target);
            for (geom, desc) in geoms.iter().zip(descs) {
                for (flag, _) in PartFlags::known() {
                    // Flags the library cannot express on this label
                    // are dropped here, and only here.
                    if table.is_flag_available(geom.num, *flag) {
                        table.set_flag(geom.num, *flag, desc.flags.contains(*flag))?;
                    }
                }
            }
            table.commit()?;
            self.queue
                .mark_completed(OperationKind::WritePartitionFlags, &disk_target);

            if let Err(e) = restore_grub(table.disk_path()) {
                self.listener.warning(&e.to_string());
            }
        }
        Ok(())
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Send => "send",
        Role::Receive => "receive",
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Local => "local",
        Mode::Unicast => "unicast",
        Mode::Multicast => "multicast",
        Mode::Link => "link",
    }
}

/// Journal endpoints for a job: paths where the job names them, the
/// transport where the network is the other end.
fn job_endpoints(job: &Job) -> (String, String) {
    let path_of = |p: &Option<PathBuf>| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    };
    match job.role {
        Role::Send => {
            let source = if job.device.is_some() {
                path_of(&job.device)
            } else {
                path_of(&job.image)
            };
            let destination = if job.mode == Mode::Local {
                path_of(&job.image)
            } else {
                mode_name(job.mode).to_string()
            };
            (source, destination)
        }
        Role::Receive => {
            let source = if job.mode == Mode::Local {
                path_of(&job.image)
            } else {
                mode_name(job.mode).to_string()
            };
            let destination = if job.device.is_some() {
                path_of(&job.device)
            } else {
                path_of(&job.image)
            };
            (source, destination)
        }
    }
}

/// `min_size < device_size × used_part`, the restore-fit rule.
pub(crate) fn fits_in_device(desc: &PartitionDesc, dev_bytes: u64) -> bool {
    if !desc.has_payload() {
        return true;
    }
    desc.min_size < (dev_bytes as f64 * desc.used_part) as u64
}

/// Scale descriptor fractions onto the target disk. MBR logical
/// partitions number from 5; everything else numbers sequentially.
pub(crate) fn plan_partitions(
    descs: &[PartitionDesc],
    disk_sectors: u64,
    label: LabelKind,
) -> Vec<PlannedPartition> {
    let mut primary_num = 0u32;
    let mut logical_num = 5u32;
    descs
        .iter()
        .map(|desc| {
            let num = if label == LabelKind::Mbr && desc.part_type == PartType::Logical {
                let n = logical_num;
                logical_num += 1;
                n
            } else {
                primary_num += 1;
                primary_num
            };
            PlannedPartition {
                num,
                part_type: desc.part_type,
                start_sector: (desc.start_pos * disk_sectors as f64).round() as u64,
                length_sectors: (desc.used_part * disk_sectors as f64).round() as u64,
                fs_tag: desc.fs_tag.clone(),
            }
        })
        .collect()
}

/// Reinstall the boot loader after a whole-disk restore. External
/// invocation; failure is reported as a warning, not a run failure.
fn restore_grub(disk: &Path) -> Result<()> {
    let status = std::process::Command::new("grub-install")
        .arg("--recheck")
        .arg(disk)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|e| Error::Warning(format!("grub-install unavailable: {e}")))?;
    if !status.success() {
        return Err(Error::Warning(format!(
            "grub-install failed on {}",
            disk.display()
        )));
    }
    Ok(())
}
