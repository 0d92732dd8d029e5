//! Tests for relay health records and ranking.
