use criterion::{criterion_group, criterion_main, Criterion};

use replaycast::recorder::SoundEvent;
use replaycast::synth::{render_timeline, ClipTable, DecodedClip};

fn bench_render_timeline(c: &mut Criterion) {
    let mut clips = ClipTable::new();
    clips.insert("hit", DecodedClip::mono(vec![0.3; 4410]));
    clips.insert("whistle", DecodedClip::stereo(vec![0.2; 8820], vec![-0.2; 8820]));

    let events: Vec<SoundEvent> = (0..500)
        .map(|i| SoundEvent {
            sound_id: if i % 3 == 0 { "whistle" } else { "hit" }.to_owned(),
            frame_index: (i * 6) % 3000,
            pan: ((i % 21) as f32 - 10.0) / 10.0,
        })
        .collect();

    c.bench_function("render_timeline_500_events_100s", |b| {
        b.iter(|| render_timeline(&events, &clips, 3000))
    });
}

criterion_group!(benches, bench_render_timeline);
criterion_main!(benches);
