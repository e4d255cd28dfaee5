//! Integration tests that decode a real container. Gated behind a fixture
//! file since the pack carries no binary test video; point
//! `CLIPBATCH_TEST_VIDEO` at a short local MP4 to exercise them.

use std::path::PathBuf;

use clipbatch_core::{BufferPool, ClipBatchError};
use clipbatch_media::Video;

fn fixture_path() -> Option<PathBuf> {
    std::env::var_os("CLIPBATCH_TEST_VIDEO").map(PathBuf::from)
}

#[test]
#[ignore = "requires CLIPBATCH_TEST_VIDEO pointing at a decodable mp4 fixture"]
fn full_batch_matches_shape_and_is_stable_across_sleep() {
    let Some(path) = fixture_path() else { return };
    let mut video = Video::open(&path).expect("open fixture video");
    let pool = BufferPool::new();

    let first = video.get_batch(&[1, 2, 3, 4], &pool).expect("first batch");
    assert_eq!(first.shape.n, 4);
    assert_eq!(first.shape.c, 3);

    video.sleep();
    assert!(video.is_sleeping());

    let second = video.get_batch(&[1, 2, 3, 4], &pool).expect("second batch");
    assert_eq!(first.as_slice(), second.as_slice());
}

#[test]
#[ignore = "requires CLIPBATCH_TEST_VIDEO pointing at a decodable mp4 fixture"]
fn out_of_range_frame_index_is_an_error() {
    let Some(path) = fixture_path() else { return };
    let mut video = Video::open(&path).expect("open fixture video");
    let pool = BufferPool::new();
    let huge = video.num_frames() + 1000;
    let err = video.get_batch(&[huge], &pool).unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn open_directory_is_eisdir() {
    let err = Video::open("/tmp").unwrap_err();
    assert!(err.is_directory() || err.is_not_found());
}

#[test]
fn open_nonexistent_is_enoent() {
    let err = Video::open("/no/such/path/clipbatch-test.mp4").unwrap_err();
    assert!(err.is_not_found());
}
