//! End-to-end sweep over real TCP sockets
//!
//! Each simulated instrument sits behind a local listener that speaks newline-terminated
//! SCPI, so the sweep exercises `TcpChannel` exactly as it would against the bench.

use bode_sweep::channel::{InstrumentChannel, SimulatedBench, TcpChannel};
use bode_sweep::sweep::{run_sweep, CancelToken, SweepConfig};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Serve one connection, answering lines that contain `?` from `instrument`.
async fn serve<C: InstrumentChannel + 'static>(instrument: C) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains('?') {
                // Unanswered queries are left to time out on the client side
                if let Ok(mut reply) = instrument.ask_raw(&line).await {
                    reply.push(b'\n');
                    if write.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            } else {
                let _ = instrument.send(&line).await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_sweep_over_tcp() {
    let bench = SimulatedBench::new(2000.0);
    let awg_addr = serve(bench.generator()).await;
    let dso_addr = serve(bench.scope()).await;

    let generator = TcpChannel::connect(&awg_addr.to_string()).await.unwrap();
    let scope = TcpChannel::connect(&dso_addr.to_string()).await.unwrap();

    let config = SweepConfig {
        start_freq_hz: 1000.0,
        end_freq_hz: 10_000.0,
        ..SweepConfig::default()
    };
    let result = run_sweep(generator, scope, config, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.len(), 10);
    for sample in &result {
        let f = sample.frequency_hz;
        assert!((sample.gain_db - bench.expected_gain_db(f)).abs() < 0.01, "{:?}", sample);
        assert!((sample.phase_deg - bench.expected_phase_deg(f)).abs() < 0.01, "{:?}", sample);
    }

    // Every frequency change was acknowledged before the scope was read
    let awg = bench.generator_log().entries();
    let frq = awg.iter().filter(|e| e.starts_with("send C1:BSWV FRQ,")).count();
    assert_eq!(frq, 10);
    assert!(awg
        .iter()
        .zip(awg.iter().skip(1))
        .filter(|(a, _)| a.starts_with("send C1:BSWV FRQ,"))
        .all(|(_, b)| b == "ask *OPC?"));
}
