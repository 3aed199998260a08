use linetable::{LineTable, TableType};

struct NumSet;

impl TableType for NumSet {
    type Element = u64;
    type Key = u64;

    fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
        elem
    }

    fn hash_key(&self, key: &u64) -> u64 {
        linetable::hash_bytes(&key.to_le_bytes())
    }

    fn key_eq(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

fn main() {
    let mut table = LineTable::new(NumSet);

    for key in 0..1000u64 {
        table.add(key);
    }

    assert_eq!(table.size(), 1000);
    assert!(table.find(&42).is_some());

    table.delete(&42);
    assert!(table.find(&42).is_none());

    let sample = table.sample_elements(5);
    println!("sampled: {:?}", sample);

    let stats = table.stats(0, true);
    println!(
        "buckets: {}, used: {}, longest probe chain: {}",
        stats.buckets,
        stats.used,
        table.longest_probing_chain()
    );
}
