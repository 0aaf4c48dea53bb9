//! Two pipelines bonded over real UDP sockets on loopback.
//!
//! The sending pipeline is built from TOML with one UDP link per receiving
//! socket; the receiving pipeline has no links of its own and is fed by
//! plain socket readers.

use bytes::Bytes;
use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use braid_bonding::config::BondingConfig;
use braid_bonding::net::transport::spawn_udp_reader;
use braid_bonding::pipeline::Pipeline;
use braid_bonding::receiver::Released;

fn sender_config(ports: &[u16], fec: bool) -> BondingConfig {
    let mut toml = String::from("version = 1\n\n[monitor]\nenabled = false\n\n");
    toml.push_str(&format!("[fec]\nenabled = {fec}\ndata_shards = 4\nparity_shards = 2\n\n"));
    for (i, port) in ports.iter().enumerate() {
        toml.push_str(&format!(
            "[[links]]\nid = {i}\nname = \"lo{i}\"\npeer = \"127.0.0.1:{port}\"\n\n"
        ));
    }
    BondingConfig::from_toml_str(&toml).unwrap()
}

struct Receiver {
    pipeline: Pipeline,
    ports: Vec<u16>,
    stop: Arc<AtomicBool>,
    readers: Vec<std::thread::JoinHandle<()>>,
}

impl Receiver {
    fn new(links: usize) -> Self {
        let mut config = BondingConfig::default();
        config.monitor.enabled = false;
        let pipeline = Pipeline::builder(config).spawn().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut ports = Vec::new();
        let mut readers = Vec::new();
        for i in 0..links {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            ports.push(socket.local_addr().unwrap().port());
            readers.push(spawn_udp_reader(i, socket, pipeline.inbound(), stop.clone()).unwrap());
        }
        Self {
            pipeline,
            ports,
            stop,
            readers,
        }
    }

    fn collect(&self, n: usize) -> Vec<Released> {
        let mut out = Vec::new();
        while out.len() < n {
            match self.pipeline.egress().recv_timeout(Duration::from_secs(3)) {
                Ok(r) => out.push(r),
                Err(_) => break,
            }
        }
        out
    }

    fn stop(mut self) -> Pipeline {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for r in self.readers.drain(..) {
            r.join().unwrap();
        }
        self.pipeline
    }
}

#[test]
fn bonded_stream_arrives_in_order() {
    let receiver = Receiver::new(2);
    let mut sender = Pipeline::from_config(sender_config(&receiver.ports, false)).unwrap();

    for i in 0..200u32 {
        sender
            .try_send(Bytes::from(format!("payload-{i}")))
            .unwrap();
    }
    let out = receiver.collect(200);
    assert_eq!(out.len(), 200);
    for (i, r) in out.iter().enumerate() {
        assert_eq!(r.sequence, i as u64);
        assert_eq!(r.payload, Bytes::from(format!("payload-{i}")));
    }

    sender.shutdown();
    let sent = sender.snapshot();
    assert_eq!(sent.packets_scheduled, 200);
    assert!(sent.links.iter().all(|l| l.frames_sent > 0));

    let mut pipeline = receiver.stop();
    pipeline.shutdown();
    let received = pipeline.snapshot();
    assert_eq!(received.packets_delivered, 200);
    assert_eq!(received.drops.authentication_failure, 0);
}

#[test]
fn fec_protected_stream_survives_dead_link() {
    // Third port has nobody listening: a third of all shards vanish.
    let receiver = Receiver::new(2);
    let dead = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);
    let mut ports = receiver.ports.clone();
    ports.push(dead_port);

    let mut sender = Pipeline::from_config(sender_config(&ports, true)).unwrap();
    for i in 0..60u8 {
        sender.try_send(Bytes::from(vec![i; 600])).unwrap();
    }
    let out = receiver.collect(60);
    assert_eq!(out.len(), 60);
    assert!(out
        .iter()
        .enumerate()
        .all(|(i, r)| r.payload[..] == vec![i as u8; 600][..]));

    sender.shutdown();
    let mut pipeline = receiver.stop();
    pipeline.shutdown();
    let snap = pipeline.snapshot();
    assert!(snap.fec.decode.blocks_recovered > 0);
    assert_eq!(snap.fec.decode.blocks_lost, 0);
}
