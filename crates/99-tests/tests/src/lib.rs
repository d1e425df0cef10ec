//! End-to-end tests for the offload link: a host session and a
//! co-processor image on real threads.

#[cfg(test)]
mod support;

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod ownership;

#[cfg(test)]
mod teardown;

#[cfg(test)]
mod desync;
