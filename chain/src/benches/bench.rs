use criterion::criterion_main;


criterion_main!(coalesce::benches, pipeline::benches);
