// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Backend-neutral description of firewall tables, chains and rules.
//!
//! The vocabulary follows nftables; rule expressions are token lists in nft
//! syntax (`iifname wg0 ip saddr 10.0.0.0/8 tcp dport 22 accept`).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallFamily {
	Inet,
	Ip,
	Ip6,
}

impl FirewallFamily {
	pub fn as_str(&self) -> &'static str {
		match self {
			FirewallFamily::Inet => "inet",
			FirewallFamily::Ip => "ip",
			FirewallFamily::Ip6 => "ip6",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
	pub family: FirewallFamily,
	pub name: String,
}

impl TableSpec {
	pub fn inet(name: impl Into<String>) -> Self {
		Self {
			family: FirewallFamily::Inet,
			name: name.into(),
		}
	}
}

impl fmt::Display for TableSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.family.as_str(), self.name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
	Filter,
	Nat,
}

impl ChainType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChainType::Filter => "filter",
			ChainType::Nat => "nat",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
	Prerouting,
	Input,
	Forward,
	Output,
	Postrouting,
}

impl Hook {
	pub fn as_str(&self) -> &'static str {
		match self {
			Hook::Prerouting => "prerouting",
			Hook::Input => "input",
			Hook::Forward => "forward",
			Hook::Output => "output",
			Hook::Postrouting => "postrouting",
		}
	}
}

/// A base chain attached to a netfilter hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
	pub table: TableSpec,
	pub name: String,
	pub chain_type: ChainType,
	pub hook: Hook,
	/// Named (`dstnat`, `srcnat`, `filter`) or numeric priority.
	pub priority: String,
}

impl ChainSpec {
	pub fn new(
		table: &TableSpec,
		name: impl Into<String>,
		chain_type: ChainType,
		hook: Hook,
		priority: impl Into<String>,
	) -> Self {
		Self {
			table: table.clone(),
			name: name.into(),
			chain_type,
			hook,
			priority: priority.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
	pub table: TableSpec,
	pub chain: String,
	pub expr: Vec<String>,
}

impl RuleSpec {
	pub fn new<I, S>(table: &TableSpec, chain: impl Into<String>, expr: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			table: table.clone(),
			chain: chain.into(),
			expr: expr.into_iter().map(Into::into).collect(),
		}
	}

	pub fn expression(&self) -> String {
		self.expr.join(" ")
	}
}

impl fmt::Display for RuleSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {} {}", self.table, self.chain, self.expression())
	}
}
