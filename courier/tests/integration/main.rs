mod concurrency;
mod delivery;
mod processing;
mod rate_limit;
mod redis;
mod shared;
