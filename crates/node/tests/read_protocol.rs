//! # Integration Tests: Read-Marker Authorization
//!
//! ## Test Categories
//!
//! | Category | What It Tests |
//! |----------|---------------|
//! | A. Counter | Strict continuation, stale markers, concurrent reads |
//! | B. Ranges | Multi-block reads, thumbnails, out-of-range blocks |
//! | C. Marker Checks | Signature, blobber, client binding |
//! | D. Shares | Auth tickets, share rows, revocation, public tickets |
//! | E. Read Pools | Pre-redeem, insufficient tokens, settlement |

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;

    use blobber_common::cid::sha256_hex;
    use blobber_node::reference::{lookup_hash, RefType};
    use blobber_node::{
        now_secs, AuthTicket, BlobberError, ContentKind, FileOperation, ReadMarker, ReadOutcome, ReadRequest,
        ShareInfo, ThumbnailUpload,
    };
    use blobber_storage::BLOCK_SIZE;

    fn request(path: &str, block_num: u64, num_blocks: u64, rm: ReadMarker) -> ReadRequest {
        ReadRequest {
            path: path.to_string(),
            block_num,
            num_blocks,
            content: ContentKind::Content,
            read_marker: rm,
            auth_ticket: None,
        }
    }

    async fn read(h: &Harness, client: &Client, req: ReadRequest) -> Result<ReadOutcome, BlobberError> {
        h.node.authorize_read(&client.ctx(), req).await
    }

    fn expect_data(outcome: ReadOutcome) -> Vec<u8> {
        match outcome {
            ReadOutcome::Data { data, .. } => data,
            other => panic!("expected data, got {:?}", other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // A. COUNTER
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_owner_reads_and_counter_advances() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"ten bytes!").await;

        let rm = h.owner.read_marker(&h.owner.id, 1);
        match read(&h, &h.owner, request("/f", 1, 1, rm.clone())).await.expect("read") {
            ReadOutcome::Data { data, latest_read_marker } => {
                assert_eq!(data, b"ten bytes!");
                assert_eq!(latest_read_marker, rm);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.node.latest_read_marker(&h.owner.id).expect("latest"), Some(rm));
    }

    #[tokio::test]
    async fn test_skipped_counter_is_stale_and_carries_last_marker() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"payload").await;

        for counter in 1..=5 {
            let rm = h.owner.read_marker(&h.owner.id, counter);
            expect_data(read(&h, &h.owner, request("/f", 1, 1, rm)).await.expect("read"));
        }

        let skipped = h.owner.read_marker(&h.owner.id, 7);
        match read(&h, &h.owner, request("/f", 1, 1, skipped)).await.expect("read") {
            ReadOutcome::Stale { latest_read_marker } => {
                assert_eq!(latest_read_marker.map(|m| m.read_counter), Some(5));
            }
            other => panic!("expected stale, got {:?}", other),
        }

        // replaying an accepted counter is stale too
        let replay = h.owner.read_marker(&h.owner.id, 5);
        assert!(matches!(
            read(&h, &h.owner, request("/f", 1, 1, replay)).await.expect("read"),
            ReadOutcome::Stale { .. }
        ));

        let next = h.owner.read_marker(&h.owner.id, 6);
        expect_data(read(&h, &h.owner, request("/f", 1, 1, next)).await.expect("read"));
        assert_eq!(h.node.latest_read_marker(&h.owner.id).expect("latest").map(|m| m.read_counter), Some(6));
    }

    #[tokio::test]
    async fn test_first_marker_must_start_from_zero() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"payload").await;

        let rm = h.owner.read_marker(&h.owner.id, 3);
        match read(&h, &h.owner, request("/f", 1, 1, rm)).await.expect("read") {
            ReadOutcome::Stale { latest_read_marker } => assert!(latest_read_marker.is_none()),
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_with_same_counter() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"payload").await;

        let rm = h.owner.read_marker(&h.owner.id, 1);
        let ctx = h.owner.ctx();
        let (a, b) = tokio::join!(
            h.node.authorize_read(&ctx, request("/f", 1, 1, rm.clone())),
            h.node.authorize_read(&ctx, request("/f", 1, 1, rm.clone()))
        );
        let outcomes = [a.expect("a"), b.expect("b")];
        let served = outcomes.iter().filter(|o| matches!(o, ReadOutcome::Data { .. })).count();
        assert_eq!(served, 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            ReadOutcome::Stale { latest_read_marker: Some(m) } if m.read_counter == 1
        )));
        assert_eq!(h.node.active_locks(), 0);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // B. RANGES
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_multi_block_range() {
        let h = Harness::new(10_000_000);
        let block = BLOCK_SIZE as usize;
        let data = random_bytes(3 * block + 10);
        h.put_file("c", "/big", &data).await;

        let rm = h.owner.read_marker(&h.owner.id, 2);
        let got = expect_data(read(&h, &h.owner, request("/big", 2, 2, rm)).await.expect("read"));
        assert_eq!(got, &data[block..3 * block]);

        let rm = h.owner.read_marker(&h.owner.id, 3);
        let tail = expect_data(read(&h, &h.owner, request("/big", 4, 1, rm)).await.expect("read"));
        assert_eq!(tail, &data[3 * block..]);

        let rm = h.owner.read_marker(&h.owner.id, 5);
        let err = read(&h, &h.owner, request("/big", 4, 2, rm)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }

    #[tokio::test]
    async fn test_zero_blocks_and_missing_file() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"x").await;

        let rm = h.owner.read_marker(&h.owner.id, 0);
        let err = read(&h, &h.owner, request("/f", 1, 0, rm)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");

        let rm = h.owner.read_marker(&h.owner.id, 1);
        let err = read(&h, &h.owner, request("/nope", 1, 1, rm)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }

    #[tokio::test]
    async fn test_thumbnail_read() {
        let h = Harness::new(1_000_000);
        let thumb = b"thumb-bytes";
        let mut payload = upload("/pic", b"the picture");
        payload.thumbnail = Some(ThumbnailUpload {
            size: thumb.len() as u64,
            content_hash: sha256_hex(thumb),
            data: thumb.to_vec(),
        });
        let staged = h.stage(&h.owner, "c", FileOperation::Insert(payload)).await;
        h.commit(&h.owner, "c", staged.connection_size).await.expect("commit");

        let mut req = request("/pic", 1, 1, h.owner.read_marker(&h.owner.id, 1));
        req.content = ContentKind::Thumbnail;
        assert_eq!(expect_data(read(&h, &h.owner, req).await.expect("read")), thumb);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // C. MARKER CHECKS
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_marker_binding_checks() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"x").await;

        let mut forged = h.owner.read_marker(&h.owner.id, 1);
        forged.read_counter = 2;
        let err = read(&h, &h.owner, request("/f", 1, 2, forged)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");

        let mut other_blobber = h.owner.read_marker(&h.owner.id, 1);
        other_blobber.blobber_id = "blobber-2".into();
        other_blobber.sign(&h.owner.keypair).expect("sign");
        let err = read(&h, &h.owner, request("/f", 1, 1, other_blobber)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");

        // a marker signed by someone else cannot ride on the owner's request
        let stranger = Client::generate();
        let theirs = stranger.read_marker(&h.owner.id, 1);
        let err = read(&h, &h.owner, request("/f", 1, 1, theirs)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");

        assert!(h.node.latest_read_marker(&h.owner.id).expect("latest").is_none());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // D. SHARES
    // ═══════════════════════════════════════════════════════════════════════

    fn ticket(h: &Harness, reader_id: &str, path: &str, ref_type: RefType) -> AuthTicket {
        let mut t = AuthTicket {
            client_id: reader_id.to_string(),
            owner_id: h.owner.id.clone(),
            allocation_id: ALLOC_ID.to_string(),
            file_path_hash: lookup_hash(ALLOC_ID, path),
            file_name: path.rsplit('/').next().unwrap_or_default().to_string(),
            ref_type,
            expiration: 0,
            timestamp: now_secs(),
            re_encryption_key: String::new(),
            signature: String::new(),
        };
        t.sign(&h.owner.keypair).expect("sign ticket");
        t
    }

    fn share(reader_id: &str, path: &str) -> ShareInfo {
        ShareInfo {
            owner_id: String::new(),
            client_id: reader_id.to_string(),
            file_path_hash: lookup_hash(ALLOC_ID, path),
            re_encryption_key: String::new(),
            revoked: false,
            available_at: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_non_owner_without_share_is_refused() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"secret").await;
        let reader = Client::generate();

        let rm = reader.read_marker(&h.owner.id, 1);
        let err = read(&h, &reader, request("/f", 1, 1, rm.clone())).await.unwrap_err();
        assert_eq!(err.code(), "invalid_share");

        // a valid ticket alone is not enough either
        let mut req = request("/f", 1, 1, rm);
        req.auth_ticket = Some(ticket(&h, &reader.id, "/f", RefType::File));
        let err = read(&h, &reader, req).await.unwrap_err();
        assert_eq!(err.code(), "invalid_share");
        assert!(h.node.latest_read_marker(&reader.id).expect("latest").is_none());
    }

    #[tokio::test]
    async fn test_shared_file_read_and_revocation() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"shared data").await;
        let reader = Client::generate();
        h.node.put_share_info(&h.owner.ctx(), share(&reader.id, "/f")).await.expect("share");

        let mut req = request("/f", 1, 1, reader.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(ticket(&h, &reader.id, "/f", RefType::File));
        assert_eq!(expect_data(read(&h, &reader, req).await.expect("read")), b"shared data");

        assert!(h
            .node
            .revoke_share_info(&h.owner.ctx(), &reader.id, &lookup_hash(ALLOC_ID, "/f"))
            .await
            .expect("revoke"));
        let mut req = request("/f", 1, 1, reader.read_marker(&h.owner.id, 2));
        req.auth_ticket = Some(ticket(&h, &reader.id, "/f", RefType::File));
        let err = read(&h, &reader, req).await.unwrap_err();
        assert_eq!(err.code(), "invalid_share");
    }

    #[tokio::test]
    async fn test_ticket_checks() {
        let h = Harness::new(1_000_000);
        h.put_file("c1", "/docs/a", b"aaa").await;
        h.put_file("c2", "/other", b"ooo").await;
        let reader = Client::generate();
        let intruder = Client::generate();
        h.node.put_share_info(&h.owner.ctx(), share(&reader.id, "/docs")).await.expect("share");
        h.node.put_share_info(&h.owner.ctx(), share(&intruder.id, "/docs")).await.expect("share");

        // directory ticket covers files below it
        let mut req = request("/docs/a", 1, 1, reader.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(ticket(&h, &reader.id, "/docs", RefType::Directory));
        expect_data(read(&h, &reader, req).await.expect("read"));

        // but not files outside it
        let mut req = request("/other", 1, 1, reader.read_marker(&h.owner.id, 2));
        req.auth_ticket = Some(ticket(&h, &reader.id, "/docs", RefType::Directory));
        let err = read(&h, &reader, req).await.unwrap_err();
        assert_eq!(err.code(), "auth_ticket_verification_failed");

        // a ticket issued to someone else
        let mut req = request("/docs/a", 1, 1, intruder.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(ticket(&h, &reader.id, "/docs", RefType::Directory));
        let err = read(&h, &intruder, req).await.unwrap_err();
        assert_eq!(err.code(), "auth_ticket_verification_failed");

        // a ticket not signed by the owner
        let mut forged = ticket(&h, &intruder.id, "/docs", RefType::Directory);
        forged.sign(&intruder.keypair).expect("sign");
        let mut req = request("/docs/a", 1, 1, intruder.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(forged);
        let err = read(&h, &intruder, req).await.unwrap_err();
        assert_eq!(err.code(), "auth_ticket_verification_failed");

        // expired
        let mut expired = ticket(&h, &intruder.id, "/docs", RefType::Directory);
        expired.expiration = 1;
        expired.sign(&h.owner.keypair).expect("sign");
        let mut req = request("/docs/a", 1, 1, intruder.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(expired);
        let err = read(&h, &intruder, req).await.unwrap_err();
        assert_eq!(err.code(), "auth_ticket_verification_failed");
    }

    #[tokio::test]
    async fn test_public_ticket() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/pub", b"for everyone").await;
        h.node.put_share_info(&h.owner.ctx(), share("", "/pub")).await.expect("share");

        let anyone = Client::generate();
        let mut req = request("/pub", 1, 1, anyone.read_marker(&h.owner.id, 1));
        req.auth_ticket = Some(ticket(&h, "", "/pub", RefType::File));
        assert_eq!(expect_data(read(&h, &anyone, req).await.expect("read")), b"for everyone");
    }

    #[tokio::test]
    async fn test_only_owner_manages_shares() {
        let h = Harness::new(1_000_000);
        h.put_file("c", "/f", b"x").await;
        let reader = Client::generate();

        let err = h.node.put_share_info(&reader.ctx(), share(&reader.id, "/f")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_operation");

        let err = h.node.put_share_info(&h.owner.ctx(), share(&reader.id, "/missing")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // E. READ POOLS
    // ═══════════════════════════════════════════════════════════════════════

    /// 64 tokens per block.
    const READ_PRICE: u64 = 1 << 20;

    #[tokio::test]
    async fn test_paid_read_needs_tokens_and_is_redeemable() {
        let h = Harness::with_prices(1_000_000, READ_PRICE, 0);
        h.put_file("c", "/f", b"paid content").await;

        let rm = h.owner.read_marker(&h.owner.id, 1);
        let err = read(&h, &h.owner, request("/f", 1, 1, rm.clone())).await.unwrap_err();
        assert!(matches!(err, BlobberError::NotEnoughTokens { want: 64, have: 0 }));
        assert!(h.node.latest_read_marker(&h.owner.id).expect("latest").is_none());

        h.chain.set_read_pools(&h.owner.id, ALLOC_ID, BLOBBER_ID, pool(100));
        expect_data(read(&h, &h.owner, request("/f", 1, 1, rm)).await.expect("read"));
        assert_eq!(h.node.pending(&h.owner.id, ALLOC_ID).expect("pending").pending_read, 64);

        // 100 - 64 left, the next block does not fit
        let rm = h.owner.read_marker(&h.owner.id, 2);
        let err = read(&h, &h.owner, request("/f", 1, 1, rm)).await.unwrap_err();
        assert_eq!(err.code(), "not_enough_tokens");

        let open = h.node.unredeemed_reads(ALLOC_ID).expect("unredeemed");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].counter, 1);
        assert!(h.node.settle_read(&h.owner.id, ALLOC_ID, 1).expect("settle"));
        assert_eq!(h.node.pending(&h.owner.id, ALLOC_ID).expect("pending").pending_read, 0);

        // released tokens are spendable again
        let rm = h.owner.read_marker(&h.owner.id, 2);
        expect_data(read(&h, &h.owner, request("/f", 1, 1, rm)).await.expect("read"));
    }

    #[tokio::test]
    async fn test_pre_redeem_read() {
        let h = Harness::with_prices(1_000_000, READ_PRICE, 0);
        h.chain.set_read_pools(&h.owner.id, ALLOC_ID, BLOBBER_ID, pool(1_000));

        let reserved = h.node.pre_redeem_read(&h.owner.ctx(), 3, 3).await.expect("pre-redeem");
        assert_eq!(reserved, 192);
        assert_eq!(h.node.pending(&h.owner.id, ALLOC_ID).expect("pending").pending_read, 192);
        assert_eq!(h.node.unredeemed_reads(ALLOC_ID).expect("unredeemed").len(), 1);
    }

    #[tokio::test]
    async fn test_refill_after_pool_top_up() {
        let h = Harness::build(1_000_000, READ_PRICE, 0, |cfg| cfg.pool_cache_ttl_secs = 0);
        h.put_file("c", "/f", b"content").await;
        h.chain.set_read_pools(&h.owner.id, ALLOC_ID, BLOBBER_ID, pool(64));

        expect_data(read(&h, &h.owner, request("/f", 1, 1, h.owner.read_marker(&h.owner.id, 1))).await.expect("read"));
        let err = read(&h, &h.owner, request("/f", 1, 1, h.owner.read_marker(&h.owner.id, 2))).await.unwrap_err();
        assert_eq!(err.code(), "not_enough_tokens");

        h.chain.set_read_pools(&h.owner.id, ALLOC_ID, BLOBBER_ID, pool(128));
        expect_data(read(&h, &h.owner, request("/f", 1, 1, h.owner.read_marker(&h.owner.id, 2))).await.expect("read"));
        assert_eq!(h.node.pending(&h.owner.id, ALLOC_ID).expect("pending").pending_read, 128);
    }
}
