/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod collection_fetch;
pub mod discovery;
pub mod discovery_policy;
pub mod discovery_queue;
pub mod http_retry;
pub mod relation_db;
