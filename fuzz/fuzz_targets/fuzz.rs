#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use mirrored_ring::MirroredRing;
use std::collections::VecDeque;

#[derive(Debug, Arbitrary)]
enum Op {
    Push(Vec<u8>),
    Pop(u16),
    Produce(u16),
    Consume(u16),
    ConsumeZero(u16),
    Set { index: i32, value: u8 },
    Clear,
}

fuzz_target!(|data: &[u8]| {
    let mut unstructured = Unstructured::new(data);
    let ops: Vec<Op> = match Vec::<Op>::arbitrary(&mut unstructured) {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut ring = MirroredRing::<u8>::new(1).unwrap();
    let cap = ring.capacity();
    let mut model = VecDeque::<u8>::new();

    for op in ops {
        match op {
            Op::Push(values) => {
                let fits = model.len() + values.len() <= cap;
                assert_eq!(ring.push_slice(&values).is_ok(), fits);
                if fits {
                    model.extend(values);
                }
            }
            Op::Pop(n) => {
                let n = n as usize;
                let mut out = vec![0u8; n];
                let fits = n <= model.len();
                assert_eq!(ring.pop_slice(&mut out).is_ok(), fits);
                if fits {
                    assert!(out.iter().copied().eq(model.drain(..n)));
                }
            }
            // Producing unwritten slots exposes whatever the ring already holds, so mirror it from the ring.
            Op::Produce(n) => {
                let n = n as usize;
                let before = ring.len();
                if ring.produce(n).is_ok() {
                    model.extend(&ring.as_slice()[before..]);
                } else {
                    assert!(model.len() + n > cap);
                }
            }
            Op::Consume(n) => {
                let n = n as usize;
                assert_eq!(ring.consume(n).is_ok(), n <= model.len());
                if n <= model.len() {
                    model.drain(..n);
                }
            }
            Op::ConsumeZero(n) => {
                let n = n as usize;
                let tail = ring.tail() as isize;
                assert_eq!(ring.consume_zero(n).is_ok(), n <= model.len());
                if n <= model.len() {
                    model.drain(..n);
                    assert!((tail..tail + n as isize).all(|i| ring.get(i) == 0));
                }
            }
            Op::Set { index, value } => {
                ring.set(index as isize, value);
                assert_eq!(ring.get(index as isize), value);
                // A positional write may land inside the unconsumed region.
                model.clear();
                model.extend(ring.as_slice());
            }
            Op::Clear => {
                ring.clear();
                model.clear();
            }
        }

        assert_eq!(ring.len(), model.len());
        assert_eq!(ring.len() + ring.free_space(), cap);
        assert_eq!(ring.as_slice(), model.make_contiguous());
    }
});
