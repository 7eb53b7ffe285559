//! 데이터 전송 테스트

mod common;

use std::time::Duration;

use bytes::Bytes;

use rawstream::packet::flags;
use rawstream::sim::Fate;
use rawstream::{Config, FaultModel, Network, Packet, RawSocket};

use common::*;

#[tokio::test]
async fn test_send_5000_bytes_in_five_segments() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let base = client.seq();
    let mut tap = pair.net.tap();

    let data = pattern(5000);
    let (client, sent, received) = transfer(client, &mut server, data.clone()).await;

    assert_eq!(sent, 5000);
    assert_eq!(received, data);
    assert_eq!(client.seq(), base.wrapping_add(5000));
    assert_eq!(server.ack(), client.seq());

    let segments: Vec<_> = captured(&mut tap)
        .into_iter()
        .filter(|(c, p)| c.source == CLIENT && is_data(p))
        .map(|(_, p)| p)
        .collect();
    assert_eq!(segments.len(), 5);

    let lengths: Vec<usize> = segments.iter().map(|p| p.payload.len()).collect();
    assert_eq!(lengths, vec![1024, 1024, 1024, 1024, 904]);

    for (i, segment) in segments.iter().enumerate() {
        assert_eq!(segment.seq, base.wrapping_add(i as u32 * 1024));
        assert_eq!(segment.has(flags::FIN), i == 4);
    }
}

#[tokio::test]
async fn test_recovers_from_lost_middle_segment() {
    let pair = setup(fast_config());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let lost = client.seq().wrapping_add(1024);
    pair.net
        .drop_next(move |bytes| matches(bytes, |p| is_data(p) && p.seq == lost));

    let data = pattern(5000);
    let (client, sent, received) = transfer(client, &mut server, data.clone()).await;

    assert_eq!(sent, 5000);
    assert_eq!(received, data);
    assert!(client.stats().retransmitted_segments > 0);
}

#[tokio::test]
async fn test_recovers_from_lost_final_segment() {
    let pair = setup(fast_config());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    pair.net
        .drop_next(|bytes| matches(bytes, |p| is_data(p) && p.has(flags::FIN)));

    let data = pattern(5000);
    let (client, sent, received) = transfer(client, &mut server, data.clone()).await;

    assert_eq!(sent, 5000);
    assert_eq!(received, data);
    assert!(client.stats().timeouts > 0);
}

#[tokio::test]
async fn test_duplicate_segment_not_appended_twice() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let duplicated = client.seq().wrapping_add(1024);
    pair.net
        .duplicate_next(move |bytes| matches(bytes, |p| is_data(p) && p.seq == duplicated));

    let data = pattern(5000);
    let (client, sent, received) = transfer(client, &mut server, data.clone()).await;

    assert_eq!(sent, 5000);
    assert_eq!(received, data);
    assert_eq!(server.ack(), client.seq());
    assert!(server.stats().duplicate_segments >= 1);
    assert_eq!(server.stats().bytes_received, 5000);
}

#[tokio::test]
async fn test_gap_answered_with_reset() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let base = client.seq();
    let lost = base.wrapping_add(1024);
    pair.net
        .drop_next(move |bytes| matches(bytes, |p| is_data(p) && p.seq == lost));
    let mut tap = pair.net.tap();

    let data = pattern(5000);
    let (_client, sent, received) = transfer(client, &mut server, data.clone()).await;
    assert_eq!(sent, 5000);
    assert_eq!(received, data);

    let from_server: Vec<_> = captured(&mut tap)
        .into_iter()
        .filter(|(c, _)| c.source == SERVER)
        .map(|(_, p)| p)
        .collect();

    // 첫 세그먼트의 ACK 다음 바로 구멍 위치의 RST+ACK
    assert_eq!(from_server[0].flags, flags::ACK);
    assert_eq!(from_server[0].ack, lost);
    assert_eq!(from_server[1].flags, flags::RST | flags::ACK);
    assert_eq!(from_server[1].ack, lost);
    assert!(server.stats().resets_sent >= 1);
}

#[tokio::test]
async fn test_send_exhaustion_returns_partial() {
    let pair = setup(impatient_config());
    let (_listener, mut client, _server) = connect(&pair, 80).await;

    // 상대가 읽지 않으므로 ACK가 오지 않음
    let sent = client.send(&pattern(5000)).await.unwrap();
    assert_eq!(sent, 0);
    assert!(client.stats().timeouts >= 4);
}

#[tokio::test]
async fn test_send_exhaustion_reports_confirmed_bytes() {
    let pair = setup(impatient_config());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let base = client.seq();

    let sender = tokio::spawn(async move {
        let mut client = client;
        let sent = client.send(&pattern(5000)).await.unwrap();
        (client, sent)
    });

    // 첫 세그먼트만 확인하고 더 읽지 않음
    let first = server.recv(1000).await.unwrap();
    assert_eq!(first.len(), 1000);

    let (client, sent) = sender.await.unwrap();
    assert_eq!(sent, 1024);
    assert_eq!(client.seq(), base.wrapping_add(1024));
    assert_eq!(client.stats().bytes_sent, 1024);
}

#[tokio::test]
async fn test_reset_below_confirmed_rewinds_window() {
    let pair = setup(Config::default());
    let (_listener, client, server) = connect(&pair, 80).await;
    let base = client.seq();
    let client_addr = client.local_addr();
    let server_addr = server.local_addr();
    let mut tap = pair.net.tap();

    // 서버 연결 대신 직접 ACK를 만드는 상대
    let peer = pair.net.host(SERVER).open().unwrap();
    let reply = |ack: u32, reply_flags: u8| {
        Packet::new(server_addr, client_addr, server.seq(), ack, reply_flags, Bytes::new()).encode()
    };

    let sender = tokio::spawn(async move {
        let mut client = client;
        client.send(&pattern(5000)).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.send_to(&reply(base.wrapping_add(3072), flags::ACK), CLIENT)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send_to(&reply(base.wrapping_add(1024), flags::RST | flags::ACK), CLIENT)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let offsets: Vec<u32> = captured(&mut tap)
        .into_iter()
        .filter(|(c, p)| c.source == CLIENT && is_data(p))
        .map(|(_, p)| p.seq.wrapping_sub(base))
        .collect();
    // 최초 버스트 다음 RST 위치부터 재전송
    assert_eq!(&offsets[..5], &[0, 1024, 2048, 3072, 4096]);
    assert_eq!(&offsets[5..], &[1024, 2048, 3072, 4096]);

    peer.send_to(&reply(base.wrapping_add(5000), flags::ACK), CLIENT)
        .await
        .unwrap();
    assert_eq!(sender.await.unwrap(), 5000);
}

#[tokio::test]
async fn test_oversized_window_does_not_overflow() {
    let pair = setup(Config {
        window_fragments: usize::MAX,
        ..Config::default()
    });
    let (_listener, client, mut server) = connect(&pair, 80).await;

    let data = pattern(5000);
    let (_client, sent, received) = transfer(client, &mut server, data.clone()).await;
    assert_eq!(sent, 5000);
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_recv_exhaustion_returns_short() {
    let pair = setup(impatient_config());
    let (_listener, _client, mut server) = connect(&pair, 80).await;

    let read = tokio::time::timeout(Duration::from_secs(1), server.recv(100))
        .await
        .unwrap()
        .unwrap();
    assert!(read.is_empty());
}

#[tokio::test]
async fn test_fin_ends_short_read() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;

    let sender = tokio::spawn(async move {
        let mut client = client;
        client.send(b"0123456789").await.unwrap()
    });

    let read = server.recv(100).await.unwrap();
    assert_eq!(&read[..], b"0123456789");
    assert_eq!(sender.await.unwrap(), 10);
}

#[tokio::test]
async fn test_recv_keeps_remainder() {
    let pair = setup(fast_config());
    let (_listener, client, mut server) = connect(&pair, 80).await;

    let data = pattern(5000);
    let payload = data.clone();
    let sender = tokio::spawn(async move {
        let mut client = client;
        client.send(&payload).await.unwrap()
    });

    let first = server.recv(1000).await.unwrap();
    assert_eq!(&first[..], &data[..1000]);
    assert_eq!(server.buffered(), 24);

    let rest = read_exact(&mut server, 4000).await;
    assert_eq!(&rest[..], &data[1000..]);
    assert_eq!(sender.await.unwrap(), 5000);
}

#[tokio::test]
async fn test_buffered_recv_needs_no_network() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;

    let data = pattern(1024);
    let payload = data.clone();
    let sender = tokio::spawn(async move {
        let mut client = client;
        client.send(&payload).await.unwrap()
    });

    let first = server.recv(1000).await.unwrap();
    assert_eq!(&first[..], &data[..1000]);
    assert_eq!(sender.await.unwrap(), 1024);

    // 남은 24바이트는 버퍼에서 바로
    let mut tap = pair.net.tap();
    let rest = server.recv(24).await.unwrap();
    assert_eq!(&rest[..], &data[1000..]);
    assert_eq!(server.buffered(), 0);
    assert!(captured(&mut tap).is_empty());
}

#[tokio::test]
async fn test_empty_send_completes() {
    let pair = setup(Config::default());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let base = client.seq();
    let mut tap = pair.net.tap();

    let sender = tokio::spawn(async move {
        let mut client = client;
        let sent = client.send(&[]).await.unwrap();
        (client, sent)
    });

    let read = server.recv(10).await.unwrap();
    assert!(read.is_empty());

    let (client, sent) = sender.await.unwrap();
    assert_eq!(sent, 0);
    // 빈 FIN은 시퀀스 번호 하나를 차지
    assert_eq!(client.seq(), base.wrapping_add(1));
    assert_eq!(server.ack(), client.seq());

    let fin = captured(&mut tap)
        .into_iter()
        .find(|(c, _)| c.source == CLIENT)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(fin.flags, flags::FIN);
    assert_eq!(fin.seq, base);

    // 이후 전송은 정상
    let (_client, sent, received) = transfer(client, &mut server, b"abc".to_vec()).await;
    assert_eq!(sent, 3);
    assert_eq!(received, b"abc");
}

#[tokio::test]
async fn test_oversized_payload_is_chunked() {
    let pair = setup(Config {
        max_transfer_size: 2048,
        ..fast_config()
    });
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let mut tap = pair.net.tap();

    let data = pattern(5000);
    let (_client, sent, received) = transfer(client, &mut server, data.clone()).await;
    assert_eq!(sent, 5000);
    assert_eq!(received, data);

    // 청크마다 마지막 세그먼트에 FIN
    let mut fin_offsets: Vec<usize> = captured(&mut tap)
        .into_iter()
        .filter(|(c, p)| c.source == CLIENT && is_data(p) && p.has(flags::FIN))
        .map(|(_, p)| p.payload.len())
        .collect();
    fin_offsets.dedup();
    assert!(fin_offsets.contains(&1024));
    assert!(fin_offsets.contains(&904));
}

#[tokio::test]
async fn test_transfer_over_lossy_network() {
    let pair = setup(fast_config());
    let (_listener, client, mut server) = connect(&pair, 80).await;
    let mut tap = pair.net.tap();
    pair.net.set_faults(FaultModel {
        loss_rate: 0.05,
        duplicate_rate: 0.05,
    });

    let data = pattern(20 * 1024);
    let sender = tokio::spawn(async move {
        let mut client = client;
        client.send(&data).await.unwrap()
    });

    let expected = pattern(20 * 1024);
    let received = read_exact(&mut server, expected.len()).await;
    assert_eq!(received, expected);

    let sent = sender.await.unwrap();
    assert!(sent <= expected.len());

    let fates: Vec<Fate> = captured(&mut tap).into_iter().map(|(c, _)| c.fate).collect();
    assert!(!fates.is_empty());
}
