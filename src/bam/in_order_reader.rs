//! Reassembles BAM records from BGZF blocks that may finish decompressing
//! out of order, and delivers them to a delegate strictly in file order
//! (spec §3/§4.I, component I).
//!
//! Each decompression worker parses its own block's header (block 0 only)
//! and records in [`BgzfDelegate::did_decompress_block`] — parsing runs in
//! parallel across workers, exactly as many blocks as are decompressing at
//! once. Only the result (a header and/or a batch of records) is handed to
//! a small min-heap keyed by block index; one thread at a time drains the
//! heap and hands ready entries to the delegate in order — the same
//! compare-and-swap "claim the drain, reschedule if more piled up while
//! draining" pattern [`SerialQueue`] uses — so only *delivery*, not
//! parsing, is serialized.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use bitflags::bitflags;
use log::error;

use crate::bgzf::reader::{BgzfDelegate, BgzfReader};
use crate::dispatch::group::Group;
use crate::dispatch::queue::{Queue, SerialQueue};
use crate::dispatch::thread_pool::ThreadPool;
use crate::error::{Error, Result};
use crate::task::Task;

bitflags! {
    /// Per-record alignment flags (spec §6's BAM record layout, `flag` field).
    ///
    /// Named and valued to match the SAM/BAM flag bitmask directly.
    #[derive(Default)]
    pub struct BamFlags: u16 {
        const TEMPLATE_HAS_MULTIPLE_SEGMENTS = 0x1;
        const PROPERLY_ALIGNED = 0x2;
        const UNMAPPED = 0x4;
        const NEXT_UNMAPPED = 0x8;
        const REVERSE_COMPLEMENTED = 0x10;
        const NEXT_REVERSE_COMPLEMENTED = 0x20;
        const FIRST_SEGMENT = 0x40;
        const LAST_SEGMENT = 0x80;
        const SECONDARY_ALIGNMENT = 0x100;
        const FAILED_FILTER = 0x200;
        const DUPLICATE = 0x400;
        const SUPPLEMENTARY_ALIGNMENT = 0x800;
    }
}

/// One reference sequence entry from the BAM header dictionary.
#[derive(Debug, Clone)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: i32,
}

/// The parsed BAM header: the free-text SAM header plus the reference
/// dictionary (spec §6 "BAM header").
#[derive(Debug, Clone, Default)]
pub struct BamHeader {
    pub text: String,
    pub references: Vec<ReferenceSequence>,
}

/// One BAM alignment record. The fixed-layout fields are decoded; CIGAR,
/// sequence, quality, and tags are left BAM-encoded in `rest` — reordering
/// only needs record *boundaries*, not their full field semantics.
#[derive(Debug, Clone)]
pub struct Record {
    pub ref_id: i32,
    pub pos: i32,
    pub next_ref_id: i32,
    pub next_pos: i32,
    pub template_len: i32,
    pub flag: BamFlags,
    pub mapq: u8,
    pub read_name: String,
    pub rest: Vec<u8>,
}

/// Receives parsed BAM data strictly in file order.
pub trait BamDelegate: Send + Sync {
    /// Called exactly once, before any [`BamDelegate::did_parse_records`].
    fn did_parse_header(&self, header: &BamHeader);
    /// Called zero or more times per block, each call carrying the
    /// records fully contained in that block's bytes, in order.
    fn did_parse_records(&self, records: Vec<Record>);
}

/// One block's worth of already-parsed BAM data, ordered solely by block
/// index so the heap below only ever compares on that key.
struct ParsedBlock {
    index: u64,
    header: Option<BamHeader>,
    records: Vec<Record>,
}

impl PartialEq for ParsedBlock {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl Eq for ParsedBlock {}
impl PartialOrd for ParsedBlock {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ParsedBlock {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.index.cmp(&other.index)
    }
}

struct ReorderState {
    heap: BinaryHeap<Reverse<ParsedBlock>>,
    next_expected: u64,
}

/// Drives in-order BAM reassembly over a [`BgzfReader`]'s output.
pub struct InOrderReader<D> {
    state: Mutex<ReorderState>,
    capacity_cv: Condvar,
    max_pending: usize,
    draining: AtomicBool,
    failed: AtomicBool,
    delivery_queue: Arc<SerialQueue>,
    group: Arc<Group>,
    delegate: Arc<D>,
    reader: OnceLock<BgzfReader>,
}

impl<D: BamDelegate + 'static> InOrderReader<D> {
    /// `max_pending` bounds how many out-of-order blocks may sit in the
    /// reorder heap before a decompression worker blocks handing one
    /// over; this, together with the BGZF reader's own ring/semaphore, is
    /// what keeps runaway out-of-order decompression from growing memory
    /// without bound.
    pub fn new(delegate: Arc<D>, pool: Arc<ThreadPool>, max_pending: usize) -> Arc<InOrderReader<D>> {
        Arc::new(InOrderReader {
            state: Mutex::new(ReorderState { heap: BinaryHeap::new(), next_expected: 0 }),
            capacity_cv: Condvar::new(),
            max_pending: max_pending.max(1),
            draining: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            delivery_queue: SerialQueue::new(pool),
            group: Arc::new(Group::new()),
            delegate,
            reader: OnceLock::new(),
        })
    }

    /// Blocks until every block handed to this reader so far has been
    /// parsed and delivered.
    pub fn wait(&self) -> Result<()> {
        self.group.wait();
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Decode("BAM reassembly aborted".into()));
        }
        Ok(())
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn fail(&self, context: &str) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            error!("biodispatch: BAM reassembly failed: {context}");
        }
        self.group.mark_failed();
    }

    /// Step 1: enforce the reorder-window back-pressure bound, then
    /// enqueue the already-parsed block into the heap.
    fn insert(&self, block: ParsedBlock) {
        let mut state = self.state.lock().unwrap();
        while state.heap.len() >= self.max_pending {
            state = self.capacity_cv.wait(state).unwrap();
        }
        state.heap.push(Reverse(block));
    }

    /// Step 2: become the sole drainer if nobody else already is one;
    /// otherwise the thread that's already draining will reach this
    /// block in its turn.
    fn try_claim_drain(&self) -> bool {
        self.draining.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Repeatedly pop the heap's minimum while it matches `next_expected`
    /// and hand it to the delivery queue; release the drain claim once
    /// nothing more is ready, with a race re-check matching
    /// `SerialQueue::drain_step`. Parsing already happened on the
    /// decompression worker that produced the block — this loop only
    /// orders and delivers.
    fn drain(&self) {
        loop {
            let popped = {
                let mut state = self.state.lock().unwrap();
                match state.heap.peek() {
                    Some(Reverse(b)) if b.index == state.next_expected => {
                        let Reverse(block) = state.heap.pop().unwrap();
                        state.next_expected += 1;
                        Some(block)
                    }
                    _ => None,
                }
            };

            let Some(block) = popped else {
                self.draining.store(false, Ordering::Release);
                let reready = {
                    let state = self.state.lock().unwrap();
                    matches!(state.heap.peek(), Some(Reverse(b)) if b.index == state.next_expected)
                };
                if reready && self.try_claim_drain() {
                    continue;
                }
                return;
            };

            self.capacity_cv.notify_all();
            if self.failed.load(Ordering::SeqCst) {
                continue;
            }
            self.deliver(block);
        }
    }

    fn deliver(&self, block: ParsedBlock) {
        let delegate = self.delegate.clone();
        self.delivery_queue.group_async(
            self.group.clone(),
            Task::from_closure(move || {
                if let Some(header) = block.header {
                    delegate.did_parse_header(&header);
                }
                if !block.records.is_empty() {
                    delegate.did_parse_records(block.records);
                }
            }),
        );
    }
}

impl<D: BamDelegate + 'static> BgzfDelegate for InOrderReader<D> {
    fn did_decompress_block(&self, reader: &BgzfReader, block_index: u64, buffer: &mut Vec<u8>) {
        let _ = self.reader.set(reader.clone());
        match parse_block(block_index, buffer) {
            Ok(block) => {
                reader.return_output_buffer(std::mem::take(buffer));
                self.insert(block);
                if self.try_claim_drain() {
                    self.drain();
                }
            }
            Err(e) => {
                self.fail(&e.to_string());
                reader.return_output_buffer(std::mem::take(buffer));
            }
        }
    }
}

/// Parses one BGZF block's worth of bytes into a [`ParsedBlock`]: the BAM
/// header if `block_index == 0`, then every record the block holds. Each
/// block is assumed self-contained — no record spans a block boundary —
/// so any bytes left over after the header and complete records are
/// accounted for mean the block is malformed rather than merely split.
fn parse_block(block_index: u64, data: &[u8]) -> Result<ParsedBlock> {
    let mut pos = 0;
    let header = if block_index == 0 {
        let (header, used) = parse_header(data)?
            .ok_or_else(|| Error::Decode("BAM header did not fit within its own BGZF block".into()))?;
        pos = used;
        Some(header)
    } else {
        None
    };

    let (records, consumed) = parse_records(&data[pos..])?;
    pos += consumed;
    if pos != data.len() {
        return Err(Error::Decode("BAM record straddled a BGZF block boundary".into()));
    }

    Ok(ParsedBlock { index: block_index, header, records })
}

/// Attempts to parse the BAM magic, header text, and reference
/// dictionary from the start of `data`. Returns `Ok(None)` if `data`
/// doesn't yet hold the whole header (the caller should retry once more
/// bytes are carried forward).
fn parse_header(data: &[u8]) -> Result<Option<(BamHeader, usize)>> {
    if data.len() < 8 {
        return Ok(None);
    }
    if &data[0..4] != b"BAM\x01" {
        return Err(Error::Decode("bad BAM magic".into()));
    }
    let l_text = i32::from_le_bytes(data[4..8].try_into().unwrap());
    if l_text < 0 {
        return Err(Error::Decode("negative BAM l_text".into()));
    }
    let l_text = l_text as usize;
    let after_text = 8 + l_text;
    if data.len() < after_text + 4 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&data[8..after_text]).into_owned();
    let n_ref = i32::from_le_bytes(data[after_text..after_text + 4].try_into().unwrap());
    if n_ref < 0 {
        return Err(Error::Decode("negative BAM n_ref".into()));
    }

    let mut pos = after_text + 4;
    let mut references = Vec::with_capacity(n_ref as usize);
    for _ in 0..n_ref {
        if data.len() < pos + 4 {
            return Ok(None);
        }
        let l_name = i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        if l_name < 1 {
            return Err(Error::Decode("non-positive BAM reference l_name".into()));
        }
        let l_name = l_name as usize;
        pos += 4;
        if data.len() < pos + l_name + 4 {
            return Ok(None);
        }
        let name_bytes = &data[pos..pos + l_name - 1]; // drop the trailing NUL
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        pos += l_name;
        let length = i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;
        references.push(ReferenceSequence { name, length });
    }

    Ok(Some((BamHeader { text, references }, pos)))
}

/// Parses as many complete BAM records as `data` holds, returning them
/// along with how many bytes were consumed; any trailing partial record
/// is left for the caller to carry forward.
fn parse_records(data: &[u8]) -> Result<(Vec<Record>, usize)> {
    const FIXED_FIELDS_LEN: usize = 32;
    let mut records = Vec::new();
    let mut pos = 0;

    loop {
        if data.len() < pos + 4 {
            break;
        }
        let block_size = i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        if block_size < FIXED_FIELDS_LEN as i32 {
            return Err(Error::Decode("BAM record block_size smaller than its fixed fields".into()));
        }
        let block_size = block_size as usize;
        let record_end = pos + 4 + block_size;
        if data.len() < record_end {
            break;
        }

        let rec = &data[pos + 4..record_end];
        let ref_id = i32::from_le_bytes(rec[0..4].try_into().unwrap());
        let rec_pos = i32::from_le_bytes(rec[4..8].try_into().unwrap());
        let l_read_name = rec[8] as usize;
        let mapq = rec[9];
        let flag = BamFlags::from_bits_truncate(u16::from_le_bytes(rec[14..16].try_into().unwrap()));
        let next_ref_id = i32::from_le_bytes(rec[20..24].try_into().unwrap());
        let next_pos = i32::from_le_bytes(rec[24..28].try_into().unwrap());
        let template_len = i32::from_le_bytes(rec[28..32].try_into().unwrap());

        let name_end = FIXED_FIELDS_LEN + l_read_name;
        if rec.len() < name_end {
            return Err(Error::Decode("BAM record read_name truncated".into()));
        }
        let read_name_bytes = &rec[FIXED_FIELDS_LEN..name_end.saturating_sub(1).max(FIXED_FIELDS_LEN)];
        let read_name = String::from_utf8_lossy(read_name_bytes).into_owned();
        let rest = rec[name_end..].to_vec();

        records.push(Record {
            ref_id,
            pos: rec_pos,
            next_ref_id,
            next_pos,
            template_len,
            flag,
            mapq,
            read_name,
            rest,
        });
        pos = record_end;
    }

    Ok((records, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn encode_header(text: &str, refs: &[(&str, i32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"BAM\x01");
        out.extend_from_slice(&(text.len() as i32).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(&(refs.len() as i32).to_le_bytes());
        for (name, length) in refs {
            let mut name_bytes = name.as_bytes().to_vec();
            name_bytes.push(0);
            out.extend_from_slice(&(name_bytes.len() as i32).to_le_bytes());
            out.extend_from_slice(&name_bytes);
            out.extend_from_slice(&length.to_le_bytes());
        }
        out
    }

    fn encode_record(ref_id: i32, pos: i32, read_name: &str) -> Vec<u8> {
        encode_record_with_flag(ref_id, pos, read_name, BamFlags::empty())
    }

    fn encode_record_with_flag(ref_id: i32, pos: i32, read_name: &str, flag: BamFlags) -> Vec<u8> {
        let mut name_bytes = read_name.as_bytes().to_vec();
        name_bytes.push(0);
        let mut body = Vec::new();
        body.extend_from_slice(&ref_id.to_le_bytes());
        body.extend_from_slice(&pos.to_le_bytes());
        body.push(name_bytes.len() as u8);
        body.push(0); // mapq
        body.extend_from_slice(&0u16.to_le_bytes()); // bin
        body.extend_from_slice(&0u16.to_le_bytes()); // n_cigar_op
        body.extend_from_slice(&flag.bits().to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes()); // l_seq
        body.extend_from_slice(&(-1i32).to_le_bytes()); // next_refID
        body.extend_from_slice(&(-1i32).to_le_bytes()); // next_pos
        body.extend_from_slice(&0i32.to_le_bytes()); // tlen
        body.extend_from_slice(&name_bytes);
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as i32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn parses_header_then_records() {
        let header_bytes = encode_header("@HD\tVN:1.6\n", &[("chr1", 1000)]);
        let (header, used) = parse_header(&header_bytes).unwrap().expect("complete header");
        assert_eq!(used, header_bytes.len());
        assert_eq!(header.text, "@HD\tVN:1.6\n");
        assert_eq!(header.references.len(), 1);
        assert_eq!(header.references[0].name, "chr1");
        assert_eq!(header.references[0].length, 1000);

        let mut records_bytes = encode_record(0, 5, "read-a");
        records_bytes.extend_from_slice(&encode_record(0, 9, "read-b"));
        let (records, used) = parse_records(&records_bytes).unwrap();
        assert_eq!(used, records_bytes.len());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].read_name, "read-a");
        assert_eq!(records[1].pos, 9);
    }

    #[test]
    fn decodes_paired_and_reverse_flags() {
        let flag = BamFlags::TEMPLATE_HAS_MULTIPLE_SEGMENTS | BamFlags::REVERSE_COMPLEMENTED;
        let bytes = encode_record_with_flag(0, 1, "read-c", flag);
        let (records, _) = parse_records(&bytes).unwrap();
        assert!(records[0].flag.contains(BamFlags::TEMPLATE_HAS_MULTIPLE_SEGMENTS));
        assert!(records[0].flag.contains(BamFlags::REVERSE_COMPLEMENTED));
        assert!(!records[0].flag.contains(BamFlags::UNMAPPED));
    }

    #[test]
    fn parse_records_leaves_a_trailing_partial_record_unconsumed() {
        let mut bytes = encode_record(0, 1, "whole");
        let full_len = bytes.len();
        bytes.extend_from_slice(&[0u8; 10]); // a truncated second record
        let (records, used) = parse_records(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(used, full_len);
    }

    struct CollectingDelegate {
        header: StdMutex<Option<BamHeader>>,
        records: StdMutex<Vec<Record>>,
    }

    impl BamDelegate for CollectingDelegate {
        fn did_parse_header(&self, header: &BamHeader) {
            *self.header.lock().unwrap() = Some(header.clone());
        }
        fn did_parse_records(&self, mut records: Vec<Record>) {
            self.records.lock().unwrap().append(&mut records);
        }
    }

    #[test]
    fn delivers_out_of_order_blocks_in_order() {
        let delegate = Arc::new(CollectingDelegate { header: StdMutex::new(None), records: StdMutex::new(Vec::new()) });
        let pool = ThreadPool::with_max_workers(2);
        let reassembler = InOrderReader::new(delegate.clone(), pool.clone(), 8);

        let mut header_and_first = encode_header("@HD\tVN:1.6\n", &[("chr1", 100)]);
        header_and_first.extend_from_slice(&encode_record(0, 1, "r0"));
        let block1 = encode_record(0, 2, "r1");
        let block2 = encode_record(0, 3, "r2");

        // Feed block 2 first, then 1, then 0: delivery must still observe
        // header, r0, r1, r2 in that order.
        reassembler.insert_block_for_test(2, block2);
        reassembler.insert_block_for_test(1, block1);
        reassembler.insert_block_for_test(0, header_and_first);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while delegate.records.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        reassembler.wait().expect("reassembly succeeds");

        assert!(delegate.header.lock().unwrap().is_some());
        let names: Vec<String> = delegate.records.lock().unwrap().iter().map(|r| r.read_name.clone()).collect();
        assert_eq!(names, vec!["r0", "r1", "r2"]);
        pool.stop(true);
    }

    impl<D: BamDelegate + 'static> InOrderReader<D> {
        /// Simulates what a decompression worker does in
        /// `did_decompress_block`: parse the raw block first, then hand
        /// only the parsed result to the reorder heap.
        fn insert_block_for_test(&self, index: u64, data: Vec<u8>) {
            let block = parse_block(index, &data).expect("test fixture parses as one self-contained block");
            self.insert(block);
            if self.try_claim_drain() {
                self.drain();
            }
        }
    }
}
