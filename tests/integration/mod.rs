mod fixtures;
mod level_barrier;
mod merge_protocol;
mod recovery;
