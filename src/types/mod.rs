/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the data types used across the crate.

pub mod data_types;

pub mod ballot;

pub mod quorum_set;

pub mod crypto_primitives;
