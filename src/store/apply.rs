//! Applying committed requests to the store
//!
//! Runs only on the store loop, once per committed entry, in log order. The
//! result depends on nothing but the store state and the request, so every
//! peer computes the same revisions and responses.

use super::lease::Lessor;
use super::mvcc::{MvccStore, RangeResult, TxnWrite};
use super::types::*;
use crate::common::{Error, Result};
use std::cmp::Ordering;

/// Read access shared by plain reads and reads inside a transaction
trait ReadView {
    fn read(&self, key: &[u8], range_end: &[u8], limit: usize, rev: i64) -> Result<RangeResult>;
}

impl ReadView for MvccStore {
    fn read(&self, key: &[u8], range_end: &[u8], limit: usize, rev: i64) -> Result<RangeResult> {
        self.range(key, range_end, limit, rev)
    }
}

impl ReadView for TxnWrite<'_> {
    fn read(&self, key: &[u8], range_end: &[u8], limit: usize, rev: i64) -> Result<RangeResult> {
        self.range(key, range_end, limit, rev)
    }
}

/// Replicated KV state: the MVCC store plus its leases
pub struct Applier {
    mvcc: MvccStore,
    lessor: Lessor,
    member_id: u64,
}

impl Applier {
    pub fn new(mvcc: MvccStore, member_id: u64) -> Self {
        Self {
            mvcc,
            lessor: Lessor::new(),
            member_id,
        }
    }

    pub fn mvcc(&self) -> &MvccStore {
        &self.mvcc
    }

    pub fn lessor(&self) -> &Lessor {
        &self.lessor
    }

    /// Apply one request carried by the entry at `index`.
    pub fn apply(&mut self, op: InternalOp, index: u64, term: u64) -> Result<InternalResponse> {
        let mut resp = match op {
            InternalOp::Range(req) => InternalResponse::Range(range(&self.mvcc, &req)?),
            InternalOp::Put(req) => InternalResponse::Put(self.apply_put(&req, index)?),
            InternalOp::DeleteRange(req) => {
                InternalResponse::DeleteRange(self.apply_delete_range(&req, index)?)
            }
            InternalOp::Txn(req) => InternalResponse::Txn(self.apply_txn(&req, index)?),
            InternalOp::Compaction(req) => {
                self.mvcc.compact(req.revision, index)?;
                InternalResponse::Compaction(CompactionResponse {
                    header: self.header(self.mvcc.rev()),
                })
            }
            InternalOp::LeaseGrant(req) => {
                InternalResponse::LeaseGrant(self.apply_lease_grant(&req, index)?)
            }
            InternalOp::LeaseRevoke(req) => {
                InternalResponse::LeaseRevoke(self.apply_lease_revoke(&req, index)?)
            }
        };
        let header = resp.header_mut();
        header.member_id = self.member_id;
        header.raft_term = term;
        Ok(resp)
    }

    fn header(&self, revision: i64) -> ResponseHeader {
        ResponseHeader {
            member_id: self.member_id,
            revision,
            raft_term: 0,
        }
    }

    fn apply_put(&mut self, req: &PutRequest, index: u64) -> Result<PutResponse> {
        let mut txn = self.mvcc.write(index)?;
        let mut resp = put(&mut txn, &mut self.lessor, req)?;
        resp.header.revision = txn.end()?;
        Ok(resp)
    }

    fn apply_delete_range(
        &mut self,
        req: &DeleteRangeRequest,
        index: u64,
    ) -> Result<DeleteRangeResponse> {
        let mut txn = self.mvcc.write(index)?;
        let mut resp = delete_range(&mut txn, &mut self.lessor, req)?;
        resp.header.revision = txn.end()?;
        Ok(resp)
    }

    fn apply_txn(&mut self, req: &TxnRequest, index: u64) -> Result<TxnResponse> {
        let mut txn = self.mvcc.write(index)?;

        let mut succeeded = true;
        for cmp in &req.compare {
            if !compare(&txn, cmp)? {
                succeeded = false;
                break;
            }
        }
        let ops = if succeeded { &req.success } else { &req.failure };
        check_requests(&txn, &self.lessor, ops)?;

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let resp = match op {
                RequestOp::Range(r) => ResponseOp::Range(range(&txn, r)?),
                RequestOp::Put(r) => ResponseOp::Put(put(&mut txn, &mut self.lessor, r)?),
                RequestOp::DeleteRange(r) => {
                    ResponseOp::DeleteRange(delete_range(&mut txn, &mut self.lessor, r)?)
                }
            };
            responses.push(resp);
        }

        let rev = txn.end()?;
        for resp in &mut responses {
            match resp {
                ResponseOp::Put(r) => r.header.revision = rev,
                ResponseOp::DeleteRange(r) => r.header.revision = rev,
                ResponseOp::Range(_) => {}
            }
        }
        Ok(TxnResponse {
            header: self.header(rev),
            succeeded,
            responses,
        })
    }

    fn apply_lease_grant(&mut self, req: &LeaseGrantRequest, index: u64) -> Result<LeaseGrantResponse> {
        let mut txn = self.mvcc.write(index)?;
        if txn.is_skipped() {
            let rev = txn.end()?;
            return Ok(LeaseGrantResponse {
                header: self.header(rev),
                id: req.id,
                ttl: req.ttl,
            });
        }
        let row = self.lessor.grant(req.id, req.ttl)?;
        txn.put_lease_row(row.id, bincode::serialize(&row)?);
        let rev = txn.end()?;
        tracing::debug!(id = row.id, ttl = row.ttl, "lessor: granted");
        Ok(LeaseGrantResponse {
            header: self.header(rev),
            id: row.id,
            ttl: row.ttl,
        })
    }

    fn apply_lease_revoke(&mut self, req: &LeaseRevokeRequest, index: u64) -> Result<LeaseRevokeResponse> {
        let mut txn = self.mvcc.write(index)?;
        if !txn.is_skipped() {
            let keys = self.lessor.revoke(req.id)?;
            for key in &keys {
                txn.delete_range(key, &[])?;
            }
            txn.delete_lease_row(req.id);
            tracing::debug!(id = req.id, keys = keys.len(), "lessor: revoked");
        }
        let rev = txn.end()?;
        Ok(LeaseRevokeResponse {
            header: self.header(rev),
        })
    }

    pub fn hash_kv(&self, revision: i64) -> Result<HashKvResponse> {
        let (hash, rev) = self.mvcc.hash_kv(revision)?;
        Ok(HashKvResponse {
            header: self.header(rev),
            hash: hash.to_hex().to_string(),
            compact_revision: self.mvcc.compact_rev(),
            applied_index: self.mvcc.consistent_index()?,
        })
    }
}

/// No order means no sort, whatever the target.
fn sort_requested(req: &RangeRequest) -> Option<(SortTarget, SortOrder)> {
    match (req.sort_order, req.sort_target) {
        (SortOrder::None, _) => None,
        // Keys already come out ascending.
        (SortOrder::Ascend, SortTarget::Key) => None,
        (order, target) => Some((target, order)),
    }
}

fn range<R: ReadView>(view: &R, req: &RangeRequest) -> Result<RangeResponse> {
    let sort = sort_requested(req);
    let limit = if req.limit <= 0 || sort.is_some() {
        0
    } else {
        // One extra to learn whether more keys remain.
        req.limit as usize + 1
    };

    let res = view.read(&req.key, &req.range_end, limit, req.revision)?;
    let mut kvs = res.kvs;

    if let Some((target, order)) = sort {
        kvs.sort_by(|a, b| {
            let ord = match target {
                SortTarget::Key => a.key.cmp(&b.key),
                SortTarget::Version => a.version.cmp(&b.version),
                SortTarget::Create => a.create_revision.cmp(&b.create_revision),
                SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
                SortTarget::Value => a.value.cmp(&b.value),
            };
            if order == SortOrder::Descend {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    let mut more = false;
    if req.limit > 0 && kvs.len() > req.limit as usize {
        kvs.truncate(req.limit as usize);
        more = true;
    }
    if req.count_only {
        kvs.clear();
    } else if req.keys_only {
        for kv in &mut kvs {
            kv.value.clear();
        }
    }

    Ok(RangeResponse {
        header: ResponseHeader {
            revision: res.rev,
            ..Default::default()
        },
        kvs,
        more,
        count: res.count as i64,
    })
}

fn put(txn: &mut TxnWrite<'_>, lessor: &mut Lessor, req: &PutRequest) -> Result<PutResponse> {
    if req.lease != NO_LEASE && lessor.lookup(req.lease).is_none() {
        return Err(Error::LeaseNotFound(req.lease));
    }
    let prev = txn.put(&req.key, &req.value, req.lease)?;
    if !txn.is_skipped() {
        if let Some(p) = &prev {
            if p.lease != NO_LEASE {
                lessor.detach(p.lease, &p.key);
            }
        }
        if req.lease != NO_LEASE {
            lessor.attach(req.lease, &req.key)?;
        }
    }
    Ok(PutResponse {
        header: ResponseHeader::default(),
        prev_kv: if req.prev_kv { prev } else { None },
    })
}

fn delete_range(
    txn: &mut TxnWrite<'_>,
    lessor: &mut Lessor,
    req: &DeleteRangeRequest,
) -> Result<DeleteRangeResponse> {
    let deleted = txn.delete_range(&req.key, &req.range_end)?;
    for kv in &deleted {
        if kv.lease != NO_LEASE {
            lessor.detach(kv.lease, &kv.key);
        }
    }
    Ok(DeleteRangeResponse {
        header: ResponseHeader::default(),
        deleted: deleted.len() as i64,
        prev_kvs: if req.prev_kv { deleted } else { Vec::new() },
    })
}

/// Evaluate one guard against the current state. A missing key compares as
/// zero revisions and version; a value guard on a missing key fails.
fn compare(txn: &TxnWrite<'_>, cmp: &Compare) -> Result<bool> {
    let kv = txn.get(&cmp.key)?;
    let ord = match (&cmp.target, &kv) {
        (CompareTarget::Value(_), None) => return Ok(false),
        (CompareTarget::Value(v), Some(kv)) => kv.value.as_slice().cmp(v.as_slice()),
        (CompareTarget::Version(v), kv) => kv.as_ref().map_or(0, |kv| kv.version).cmp(v),
        (CompareTarget::CreateRevision(v), kv) => {
            kv.as_ref().map_or(0, |kv| kv.create_revision).cmp(v)
        }
        (CompareTarget::ModRevision(v), kv) => kv.as_ref().map_or(0, |kv| kv.mod_revision).cmp(v),
    };
    Ok(match cmp.result {
        CompareResult::Equal => ord == Ordering::Equal,
        CompareResult::Greater => ord == Ordering::Greater,
        CompareResult::Less => ord == Ordering::Less,
    })
}

/// Reject a branch up front so a failing op never leaves half a transaction.
fn check_requests(txn: &TxnWrite<'_>, lessor: &Lessor, ops: &[RequestOp]) -> Result<()> {
    for op in ops {
        match op {
            RequestOp::Put(r) if r.lease != NO_LEASE && lessor.lookup(r.lease).is_none() => {
                return Err(Error::LeaseNotFound(r.lease));
            }
            RequestOp::Range(r) if r.revision > 0 => {
                txn.read(&r.key, &r.range_end, 1, r.revision)?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemBackend;

    fn applier() -> Applier {
        Applier::new(MvccStore::new(Box::new(MemBackend::new())), 1)
    }

    fn apply(a: &mut Applier, op: InternalOp) -> Result<InternalResponse> {
        a.apply(op, 0, 1)
    }

    fn put_kv(a: &mut Applier, k: &str, v: &str) -> i64 {
        match apply(a, InternalOp::Put(PutRequest::new(k, v))).unwrap() {
            InternalResponse::Put(r) => r.header.revision,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn range_of(a: &mut Applier, req: RangeRequest) -> RangeResponse {
        match apply(a, InternalOp::Range(req)).unwrap() {
            InternalResponse::Range(r) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_range_limit_sets_more() {
        let mut a = applier();
        for k in ["a", "b", "c"] {
            put_kv(&mut a, k, "v");
        }
        let r = range_of(&mut a, RangeRequest::from_key("a").with_limit(2));
        assert_eq!(r.kvs.len(), 2);
        assert!(r.more);
        assert_eq!(r.count, 3);

        let r = range_of(&mut a, RangeRequest::from_key("a").with_limit(3));
        assert!(!r.more);
    }

    #[test]
    fn test_range_sorted_descending_by_mod() {
        let mut a = applier();
        put_kv(&mut a, "x", "1");
        put_kv(&mut a, "y", "2");
        put_kv(&mut a, "x", "3");

        let r = range_of(
            &mut a,
            RangeRequest::from_key("")
                .with_sort(SortTarget::Mod, SortOrder::Descend)
                .with_limit(1),
        );
        assert_eq!(r.kvs.len(), 1);
        assert_eq!(r.kvs[0].key, b"x");
        assert!(r.more);
    }

    #[test]
    fn test_sort_target_without_order_keeps_key_order() {
        let mut a = applier();
        put_kv(&mut a, "a", "z");
        put_kv(&mut a, "b", "a");

        let r = range_of(
            &mut a,
            RangeRequest::from_key("").with_sort(SortTarget::Value, SortOrder::None),
        );
        let keys: Vec<_> = r.kvs.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_txn_range_sorted_at_past_revision() {
        let mut a = applier();
        put_kv(&mut a, "a", "1");
        let rev = put_kv(&mut a, "b", "2");
        put_kv(&mut a, "a", "3");

        let txn = TxnRequest {
            compare: vec![],
            success: vec![
                RequestOp::Put(PutRequest::new("c", "9")),
                RequestOp::Range(
                    RangeRequest::from_key("")
                        .with_revision(rev)
                        .with_sort(SortTarget::Value, SortOrder::Descend)
                        .with_limit(1),
                ),
            ],
            failure: vec![],
        };
        let resp = match apply(&mut a, InternalOp::Txn(txn)).unwrap() {
            InternalResponse::Txn(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        match &resp.responses[1] {
            ResponseOp::Range(r) => {
                // At that revision "a" still held "1" and "c" did not exist.
                assert_eq!(r.kvs.len(), 1);
                assert_eq!(r.kvs[0].key, b"b");
                assert_eq!(r.kvs[0].value, b"2");
                assert_eq!(r.count, 2);
                assert!(r.more);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_txn_compare_on_missing_key() {
        let mut a = applier();
        let create_if_absent = TxnRequest {
            compare: vec![Compare::version("k", CompareResult::Equal, 0)],
            success: vec![RequestOp::Put(PutRequest::new("k", "first"))],
            failure: vec![RequestOp::Range(RangeRequest::key("k"))],
        };
        let resp = match apply(&mut a, InternalOp::Txn(create_if_absent.clone())).unwrap() {
            InternalResponse::Txn(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert!(resp.succeeded);
        assert_eq!(resp.header.revision, 2);

        let resp = match apply(&mut a, InternalOp::Txn(create_if_absent)).unwrap() {
            InternalResponse::Txn(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert!(!resp.succeeded);
        match &resp.responses[0] {
            ResponseOp::Range(r) => assert_eq!(r.kvs[0].value, b"first"),
            other => panic!("unexpected {:?}", other),
        }

        let value_guard = TxnRequest {
            compare: vec![Compare::value("missing", CompareResult::Equal, "")],
            ..Default::default()
        };
        match apply(&mut a, InternalOp::Txn(value_guard)).unwrap() {
            InternalResponse::Txn(r) => assert!(!r.succeeded),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_txn_ops_share_revision_and_see_earlier_ops() {
        let mut a = applier();
        let txn = TxnRequest {
            compare: vec![],
            success: vec![
                RequestOp::Put(PutRequest::new("a", "1")),
                RequestOp::Put(PutRequest::new("b", "2")),
                RequestOp::Range(RangeRequest::from_key("a")),
            ],
            failure: vec![],
        };
        let resp = match apply(&mut a, InternalOp::Txn(txn)).unwrap() {
            InternalResponse::Txn(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(resp.header.revision, 2);
        match &resp.responses[2] {
            ResponseOp::Range(r) => assert_eq!(r.kvs.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_put_with_unknown_lease() {
        let mut a = applier();
        let err = apply(&mut a, InternalOp::Put(PutRequest::new("k", "v").with_lease(42)));
        assert!(matches!(err, Err(Error::LeaseNotFound(42))));

        let txn = TxnRequest {
            success: vec![
                RequestOp::Put(PutRequest::new("ok", "v")),
                RequestOp::Put(PutRequest::new("k", "v").with_lease(42)),
            ],
            ..Default::default()
        };
        assert!(matches!(
            apply(&mut a, InternalOp::Txn(txn)),
            Err(Error::LeaseNotFound(42))
        ));
        assert!(range_of(&mut a, RangeRequest::key("ok")).kvs.is_empty());
        assert_eq!(a.mvcc().rev(), 1);
    }

    #[test]
    fn test_lease_revoke_deletes_attached_keys_in_one_revision() {
        let mut a = applier();
        apply(&mut a, InternalOp::LeaseGrant(LeaseGrantRequest { ttl: 60, id: 9 })).unwrap();
        assert!(matches!(
            apply(&mut a, InternalOp::LeaseGrant(LeaseGrantRequest { ttl: 60, id: 9 })),
            Err(Error::LeaseExists(9))
        ));

        apply(&mut a, InternalOp::Put(PutRequest::new("a", "1").with_lease(9))).unwrap();
        apply(&mut a, InternalOp::Put(PutRequest::new("b", "2").with_lease(9))).unwrap();
        put_kv(&mut a, "c", "3");
        let before = a.mvcc().rev();

        let resp = apply(&mut a, InternalOp::LeaseRevoke(LeaseRevokeRequest { id: 9 })).unwrap();
        match resp {
            InternalResponse::LeaseRevoke(r) => assert_eq!(r.header.revision, before + 1),
            other => panic!("unexpected {:?}", other),
        }
        let left = range_of(&mut a, RangeRequest::from_key(""));
        assert_eq!(left.kvs.len(), 1);
        assert_eq!(left.kvs[0].key, b"c");
        assert!(a.lessor().is_empty());
    }

    #[test]
    fn test_compaction_errors_surface() {
        let mut a = applier();
        let r1 = put_kv(&mut a, "k", "1");
        let r2 = put_kv(&mut a, "k", "2");
        apply(&mut a, InternalOp::Compaction(CompactionRequest { revision: r2 })).unwrap();

        assert!(matches!(
            apply(&mut a, InternalOp::Range(RangeRequest::key("k").with_revision(r1))),
            Err(Error::Compacted)
        ));
        assert!(matches!(
            apply(&mut a, InternalOp::Compaction(CompactionRequest { revision: r1 })),
            Err(Error::Compacted)
        ));
        assert!(matches!(
            apply(&mut a, InternalOp::Compaction(CompactionRequest { revision: 99 })),
            Err(Error::FutureRevision)
        ));
    }

    #[test]
    fn test_header_carries_member_and_term() {
        let mut a = applier();
        let resp = a.apply(InternalOp::Put(PutRequest::new("k", "v")), 3, 7).unwrap();
        match resp {
            InternalResponse::Put(r) => {
                assert_eq!(r.header.member_id, 1);
                assert_eq!(r.header.raft_term, 7);
                assert_eq!(r.header.revision, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
