//! End-to-end scenarios that run without root or real block devices:
//! local image round trips, TCP fan-out with a dropped receiver,
//! relay-chain forwarding, and wire-format failure behavior.

use anyhow::Result;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use drivecast::archive;
use drivecast::error::Error;
use drivecast::image::{ImageHeader, ImageType, LabelKind, PartFlags, PartType, PartitionDesc};
use drivecast::net::{accept_receivers, connect_to_sender, handshake_server};
use drivecast::protocol::{DESC_LEN, HEADER_LEN};
use drivecast::transfer::{CancelToken, NoopListener, TransferHub};

fn free_port() -> u16 {
    let sock = TcpListener::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

fn write_file(path: &Path, byte: u8, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(&vec![byte; size])?;
    Ok(())
}

fn new_hub() -> TransferHub {
    TransferHub::new(CancelToken::new(), Arc::new(NoopListener))
}

/// A 4 KiB image of 0xAA survives a local store-then-restore byte for
/// byte.
#[test]
fn single_file_image_round_trips_locally() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("source.img");
    let stored = dir.path().join("stored.img");
    let restored = dir.path().join("restored.img");
    write_file(&source, 0xAA, 4096)?;

    // Store: file -> image.
    let mut hub = new_hub();
    hub.add_sink("image", Box::new(std::fs::File::create(&stored)?));
    hub.set_total(4096, false);
    let mut src = std::fs::File::open(&source)?;
    hub.transfer_all_from(&mut src)?;
    hub.flush_sinks()?;
    drop(hub);

    // Restore: image -> file.
    let mut hub = new_hub();
    hub.set_source(Box::new(std::fs::File::open(&stored)?));
    hub.set_total(4096, false);
    let mut out = std::fs::File::create(&restored)?;
    hub.transfer_all_to(&mut out)?;

    assert_eq!(std::fs::read(&source)?, std::fs::read(&restored)?);
    assert_eq!(std::fs::read(&restored)?, vec![0xAA; 4096]);
    Ok(())
}

/// Unicast fan-out to three receivers; one closes its socket
/// mid-stream. The survivors finish with identical bytes and the
/// dropped peer holds a strict prefix.
#[test]
fn fan_out_survives_a_dropped_receiver() -> Result<()> {
    let port = free_port();
    let payload: Vec<u8> = (0..2_000_000usize).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();

    let mut receivers = Vec::new();
    for i in 0..3 {
        receivers.push(thread::spawn(move || -> Vec<u8> {
            let mut stream = loop {
                match connect_to_sender(IpAddr::V4(Ipv4Addr::LOCALHOST), port) {
                    Ok(s) => break s,
                    Err(_) => thread::sleep(Duration::from_millis(20)),
                }
            };
            let mut got = Vec::new();
            if i == 1 {
                // This peer gives up after a taste of the stream.
                let mut buf = vec![0u8; 64 * 1024];
                let n = stream.read(&mut buf).unwrap_or(0);
                got.extend_from_slice(&buf[..n]);
                drop(stream);
            } else {
                stream.read_to_end(&mut got).unwrap();
            }
            got
        }));
    }

    let peers = accept_receivers(port, 3, Some(Duration::from_secs(10)))?;
    assert_eq!(peers.len(), 3);

    let mut hub = new_hub();
    for (mut stream, addr) in peers {
        handshake_server(&mut stream)?;
        hub.add_sink(addr.to_string(), Box::new(stream));
    }
    hub.set_total(payload.len() as u64, true);

    // The dropped peer must not fail the run.
    hub.transfer_all_from(&mut Cursor::new(payload))?;
    hub.flush_sinks()?;
    drop(hub); // closes the sockets so read_to_end returns

    let results: Vec<Vec<u8>> = receivers.into_iter().map(|r| r.join().unwrap()).collect();
    assert_eq!(results[0], expected);
    assert_eq!(results[2], expected);
    assert!(results[1].len() < expected.len());
    assert_eq!(&expected[..results[1].len()], &results[1][..]);
    Ok(())
}

/// Two chained hops: head -> relay -> tail. The relay keeps a local
/// copy while forwarding; head, relay, and tail all end up identical.
#[test]
fn relay_chain_carries_identical_bytes() -> Result<()> {
    let relay_port = free_port();
    let tail_port = free_port();
    let payload: Vec<u8> = (0..1_500_000usize).map(|i| (i % 241) as u8).collect();
    let total = payload.len() as u64;
    let expected = payload.clone();

    // Tail: receives from the relay.
    let tail = thread::spawn(move || -> Vec<u8> {
        let listener = TcpListener::bind(("127.0.0.1", tail_port)).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut hub = new_hub();
        hub.set_source(Box::new(stream));
        hub.set_total(total, true);
        let mut got = Vec::new();
        hub.transfer_all_to(&mut got).unwrap();
        got
    });

    // Relay: local copy plus forwarding sink.
    let relay = thread::spawn(move || -> Vec<u8> {
        let listener = TcpListener::bind(("127.0.0.1", relay_port)).unwrap();
        let (upstream, _) = listener.accept().unwrap();

        let downstream = loop {
            match std::net::TcpStream::connect(("127.0.0.1", tail_port)) {
                Ok(s) => break s,
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        };

        let mut hub = new_hub();
        hub.set_source(Box::new(upstream));
        hub.add_sink("tail", Box::new(downstream));
        hub.set_total(total, true);
        let mut local = Vec::new();
        hub.transfer_all_to(&mut local).unwrap();
        local
    });

    // Head: plain send into the relay.
    let downstream = loop {
        match std::net::TcpStream::connect(("127.0.0.1", relay_port)) {
            Ok(s) => break s,
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    };
    let mut hub = new_hub();
    hub.add_sink("relay", Box::new(downstream));
    hub.set_total(total, true);
    hub.transfer_all_from(&mut Cursor::new(payload))?;
    hub.flush_sinks()?;
    drop(hub);

    assert_eq!(relay.join().unwrap(), expected);
    assert_eq!(tail.join().unwrap(), expected);
    Ok(())
}

/// A magic mismatch is detected from the header alone; not one payload
/// byte is consumed.
#[test]
fn bad_magic_consumes_no_payload() {
    let mut stream = Vec::new();
    let good = ImageHeader {
        image_type: ImageType::Partition,
        label_kind: LabelKind::None,
        partition_count: 1,
        image_size: 512,
    };
    let mut corrupted = good.encode();
    corrupted[0..6].copy_from_slice(b"NOTDVC");
    stream.extend_from_slice(&corrupted);
    stream.extend_from_slice(&[0xEE; 512]); // payload that must stay untouched

    let mut cursor = Cursor::new(stream);
    match ImageHeader::read_from(&mut cursor) {
        Err(Error::InvalidImage(_)) => {}
        other => panic!("expected InvalidImage, got {other:?}"),
    }
    assert_eq!(
        cursor.position() as usize,
        HEADER_LEN,
        "only the fixed header may be consumed"
    );
}

/// A complete DISK-image stream (header, descriptor, size-prefixed
/// archive) round-trips through the wire framing: the receiver parses
/// it back and materializes the identical tree.
#[test]
fn image_stream_framing_round_trips() -> Result<()> {
    let src_tree = tempfile::tempdir()?;
    let dst_tree = tempfile::tempdir()?;
    std::fs::create_dir(src_tree.path().join("boot"))?;
    write_file(&src_tree.path().join("boot/vmlinuz"), 0x7F, 100_000)?;
    write_file(&src_tree.path().join("initrd.img"), 0x1B, 50_000)?;

    // Sender side: spool the archive, then emit the framed stream.
    let (mut spool, archive_len) = archive::spool_tree(src_tree.path())?;
    let desc = PartitionDesc {
        part_type: PartType::Primary,
        flags: PartFlags(PartFlags::BOOT),
        min_size: 150_000,
        start_pos: 0.25,
        used_part: 0.5,
        fs_tag: "ext4".into(),
        label: "boot".into(),
        uuid: "1234-abcd".into(),
    };
    let header = ImageHeader {
        image_type: ImageType::Disk,
        label_kind: LabelKind::Gpt,
        partition_count: 1,
        image_size: 8 + archive_len,
    };

    let mut wire = Vec::new();
    wire.extend_from_slice(&header.encode());
    wire.extend_from_slice(&desc.encode());
    wire.extend_from_slice(&archive_len.to_be_bytes());
    spool.seek(SeekFrom::Start(0))?;
    spool.read_to_end(&mut wire)?;

    assert_eq!(
        wire.len(),
        HEADER_LEN + DESC_LEN + 8 + archive_len as usize
    );

    // Receiver side: parse through the hub like the restore path does.
    let total = wire.len() as u64;
    let mut hub = new_hub();
    hub.set_source(Box::new(Cursor::new(wire)));
    hub.set_total(total, false);

    let mut hbuf = [0u8; HEADER_LEN];
    hub.transfer_to(&mut hbuf)?;
    let got_header = ImageHeader::decode(&hbuf)?;
    assert_eq!(got_header, header);

    let mut dbuf = [0u8; DESC_LEN];
    hub.transfer_to(&mut dbuf)?;
    let got_desc = PartitionDesc::decode(&dbuf)?;
    assert_eq!(got_desc, desc);

    let mut prefix = [0u8; 8];
    hub.transfer_to(&mut prefix)?;
    let len = u64::from_be_bytes(prefix);
    assert_eq!(len, archive_len);

    let mut reader = hub.source_reader(len);
    archive::read_tree(&mut reader, dst_tree.path())?;

    assert_eq!(
        std::fs::read(dst_tree.path().join("boot/vmlinuz"))?,
        vec![0x7F; 100_000]
    );
    assert_eq!(
        std::fs::read(dst_tree.path().join("initrd.img"))?,
        vec![0x1B; 50_000]
    );
    Ok(())
}

/// A cancel mid-transfer raises at a chunk boundary, and the partial
/// output is a prefix of the source.
#[test]
fn cancel_mid_transfer_leaves_a_clean_prefix() -> Result<()> {
    struct CancelAfter {
        token: CancelToken,
        threshold: u64,
    }
    impl drivecast::transfer::TransferListener for CancelAfter {
        fn progress(&self, transferred: u64, _total: u64) {
            if transferred >= self.threshold {
                self.token.cancel();
            }
        }
    }

    let dir = tempfile::tempdir()?;
    let out_path = dir.path().join("partial.img");
    let payload: Vec<u8> = (0..4_000_000usize).map(|i| (i % 239) as u8).collect();

    let token = CancelToken::new();
    let listener = Arc::new(CancelAfter {
        token: token.clone(),
        threshold: payload.len() as u64 / 4,
    });
    let mut hub = TransferHub::new(token, listener);
    hub.add_sink("image", Box::new(std::fs::File::create(&out_path)?));
    hub.set_total(payload.len() as u64, false);

    match hub.transfer_all_from(&mut Cursor::new(payload.clone())) {
        Err(Error::Cancel) => {}
        other => panic!("expected Cancel, got {other:?}"),
    }
    hub.flush_sinks()?;
    drop(hub);

    let partial = std::fs::read(&out_path)?;
    assert!(!partial.is_empty() && partial.len() < payload.len());
    assert_eq!(&payload[..partial.len()], &partial[..]);
    Ok(())
}
