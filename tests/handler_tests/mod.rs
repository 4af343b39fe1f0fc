mod channel_test;
mod concurrency_test;
mod lifecycle_test;
mod scenario_test;
