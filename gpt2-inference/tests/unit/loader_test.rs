use super::*;
use gpt2_weights::InMemoryStore;
use std::cell::Cell;

const TINY: HyperParams = HyperParams { n_vocab: 3, n_ctx: 2, n_embd: 2, n_head: 1, n_layer: 2 };

fn sequential(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

struct CountingSource {
    payload: Vec<u8>,
    fetches: Cell<usize>,
}

impl CountingSource {
    fn new(values: &[f32]) -> Self {
        Self { payload: to_bytes(values), fetches: Cell::new(0) }
    }
}

impl WeightSource for CountingSource {
    fn fetch(&self, on_progress: &mut dyn FnMut(u8)) -> gpt2_weights::Result<Vec<u8>> {
        self.fetches.set(self.fetches.get() + 1);
        on_progress(50);
        on_progress(100);
        Ok(self.payload.clone())
    }
}

struct FailingSource;

impl WeightSource for FailingSource {
    fn fetch(&self, _on_progress: &mut dyn FnMut(u8)) -> gpt2_weights::Result<Vec<u8>> {
        Err(WeightsError::Network("failed to fetch file with status (404) Not Found".to_string()))
    }
}

#[derive(Default)]
struct CountingStore {
    inner: InMemoryStore,
    writes: usize,
    reject_writes: bool,
}

impl BlobStore for CountingStore {
    fn put(&mut self, values: &[f32]) -> gpt2_weights::Result<()> {
        self.writes += 1;
        if self.reject_writes {
            return Err(WeightsError::CacheWrite("disk full".to_string()));
        }
        self.inner.put(values)
    }

    fn get(&self) -> gpt2_weights::Result<Vec<f32>> {
        self.inner.get()
    }

    fn delete(&mut self) -> gpt2_weights::Result<()> {
        self.inner.delete()
    }

    fn exists(&self) -> gpt2_weights::Result<bool> {
        self.inner.exists()
    }
}

#[test]
fn test_block_order_is_lexicographic() {
    assert_eq!(block_order(12), vec![0, 1, 10, 11, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(block_order(3), vec![0, 1, 2]);
    assert!(block_order(0).is_empty());
}

#[test]
fn test_deserialize_follows_stream_layout() {
    let hparams = HyperParams { n_layer: 1, ..TINY };
    let values = sequential(hparams.expected_weight_count());

    let params = deserialize(&values, &hparams).unwrap();
    let block = &params.blocks[0];

    // c_attn: bias (6) then weight (2 x 6)
    assert_eq!(block.attn.c_attn.bias, sequential(6));
    assert_eq!(block.attn.c_attn.weight.shape(), (2, 6));
    assert_eq!(block.attn.c_attn.weight.row(1)[0], 12.0);
    // attn c_proj: bias (2) then weight (2 x 2)
    assert_eq!(block.attn.c_proj.bias, vec![18.0, 19.0]);
    assert_eq!(block.attn.c_proj.weight.as_slice(), &[20.0, 21.0, 22.0, 23.0]);
    // layer norms store bias before gain
    assert_eq!(block.ln_1.bias, vec![24.0, 25.0]);
    assert_eq!(block.ln_1.gain, vec![26.0, 27.0]);
    assert_eq!(block.ln_2.bias, vec![28.0, 29.0]);
    assert_eq!(block.ln_2.gain, vec![30.0, 31.0]);
    assert_eq!(block.mlp.c_fc.bias, (32..40).map(|v| v as f32).collect::<Vec<_>>());
    assert_eq!(block.mlp.c_fc.weight.shape(), (2, 8));
    assert_eq!(block.mlp.c_proj.bias, vec![56.0, 57.0]);
    assert_eq!(block.mlp.c_proj.weight.shape(), (8, 2));
    assert_eq!(block.mlp.c_proj.weight.get(7, 1), 73.0);

    assert_eq!(params.ln_f.bias, vec![74.0, 75.0]);
    assert_eq!(params.ln_f.gain, vec![76.0, 77.0]);
    assert_eq!(params.wpe.as_slice(), &[78.0, 79.0, 80.0, 81.0]);
    assert_eq!(params.wte.as_slice(), &[82.0, 83.0, 84.0, 85.0, 86.0, 87.0]);
    assert_eq!(params.wte_t.as_slice(), &[82.0, 84.0, 86.0, 83.0, 85.0, 87.0]);
}

#[test]
fn test_deserialize_places_blocks_by_layer_name() {
    let hparams = HyperParams { n_vocab: 1, n_ctx: 1, n_embd: 1, n_head: 1, n_layer: 12 };
    let per_block = hparams.block_weight_count();

    // every float of a block carries its position in the stream
    let mut values: Vec<f32> = (0..12).flat_map(|slot| vec![slot as f32; per_block]).collect();
    values.extend([0.0; 4]);

    let params = deserialize(&values, &hparams).unwrap();
    let slots: Vec<f32> = params.blocks.iter().map(|b| b.ln_1.gain[0]).collect();

    assert_eq!(slots, vec![0.0, 1.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 2.0, 3.0]);
}

#[test]
fn test_deserialize_rejects_wrong_length() {
    let expected = TINY.expected_weight_count();

    for len in [0, expected - 1, expected + 1] {
        match deserialize(&sequential(len), &TINY) {
            Err(Error::CorruptWeightStream { expected: e, actual }) => {
                assert_eq!(e, expected);
                assert_eq!(actual, len);
            }
            other => panic!("expected a corrupt stream error, got {other:?}"),
        }
    }
}

#[test]
fn test_second_load_is_served_from_store() {
    let values = sequential(TINY.expected_weight_count());
    let mut loader = WeightLoader::new(CountingSource::new(&values), CountingStore::default(), TINY);
    let mut progress = Vec::new();

    assert!(!loader.exists().unwrap());
    let first = loader.load(&mut |p| progress.push(p)).unwrap();
    assert_eq!(loader.source().fetches.get(), 1);
    assert_eq!(loader.store().writes, 1);
    assert_eq!(progress, vec![50, 100]);
    assert!(loader.exists().unwrap());

    let second = loader.load(&mut |_| panic!("no download expected")).unwrap();
    assert_eq!(loader.source().fetches.get(), 1);
    assert_eq!(loader.store().writes, 1);
    assert_eq!(first.wte, second.wte);
}

#[test]
fn test_clear_forces_a_new_download() {
    let values = sequential(TINY.expected_weight_count());
    let mut loader = WeightLoader::new(CountingSource::new(&values), CountingStore::default(), TINY);

    loader.load(&mut |_| {}).unwrap();
    loader.clear().unwrap();
    assert!(!loader.exists().unwrap());

    loader.load(&mut |_| {}).unwrap();
    assert_eq!(loader.source().fetches.get(), 2);
    assert_eq!(loader.store().writes, 2);
}

#[test]
fn test_cache_write_failure_is_not_fatal() {
    let values = sequential(TINY.expected_weight_count());
    let store = CountingStore { reject_writes: true, ..Default::default() };
    let mut loader = WeightLoader::new(CountingSource::new(&values), store, TINY);

    let params = loader.load(&mut |_| {}).unwrap();
    assert_eq!(params.blocks.len(), 2);
    assert!(!loader.exists().unwrap());

    loader.load(&mut |_| {}).unwrap();
    assert_eq!(loader.source().fetches.get(), 2);
}

#[test]
fn test_corrupt_download_is_not_persisted() {
    let values = sequential(TINY.expected_weight_count() - 1);
    let mut loader = WeightLoader::new(CountingSource::new(&values), CountingStore::default(), TINY);

    assert!(matches!(loader.load(&mut |_| {}), Err(Error::CorruptWeightStream { .. })));
    assert_eq!(loader.store().writes, 0);
    assert!(!loader.exists().unwrap());
}

#[test]
fn test_misaligned_download_is_rejected() {
    let source = CountingSource { payload: vec![0u8; 7], fetches: Cell::new(0) };
    let mut loader = WeightLoader::new(source, CountingStore::default(), TINY);

    let err = loader.load(&mut |_| {}).unwrap_err();
    assert!(matches!(err, Error::Weights(WeightsError::MisalignedPayload { len: 7 })));
}

#[test]
fn test_network_failure_is_surfaced() {
    let mut loader = WeightLoader::new(FailingSource, CountingStore::default(), TINY);

    let err = loader.load(&mut |_| {}).unwrap_err();
    assert!(matches!(err, Error::Weights(WeightsError::Network(_))));
    assert!(err.to_string().contains("404"));
}

#[test]
fn test_corrupt_cached_blob_is_reported() {
    let mut store = CountingStore::default();
    store.inner.put(&[1.0, 2.0, 3.0]).unwrap();
    let mut loader = WeightLoader::new(FailingSource, store, TINY);

    assert!(matches!(loader.load(&mut |_| {}), Err(Error::CorruptWeightStream { actual: 3, .. })));
}
