//! インバウンドルールの評価
//!
//! セキュリティグループのインバウンドルールを表現し、
//! 送信元アドレスとポートに対して許可・拒否を判定します。

use crate::error::{FlowError, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// プロトコル種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// インバウンドルール1件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl IngressRule {
    pub fn new(protocol: Protocol, port: u16, cidr: Ipv4Net) -> Self {
        Self {
            protocol,
            from_port: port,
            to_port: port,
            cidr,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn matches(&self, source: Ipv4Addr, protocol: Protocol, port: u16) -> bool {
        self.protocol == protocol
            && (self.from_port..=self.to_port).contains(&port)
            && self.cidr.contains(&source)
    }
}

/// インバウンドルールの集合（デフォルト拒否）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPolicy {
    pub rules: Vec<IngressRule>,
}

impl IngressPolicy {
    pub fn new(rules: Vec<IngressRule>) -> Self {
        Self { rules }
    }

    /// ファイルゲートウェイに必要なポートを、指定CIDRからのみ許可するポリシー
    ///
    /// - TCP 80: ゲートウェイのアクティベーション
    /// - TCP/UDP 111: portmapper
    /// - TCP/UDP 2049: NFS
    /// - TCP/UDP 20048: mountd
    pub fn file_gateway(cidr: Ipv4Net) -> Self {
        let mut rules = vec![IngressRule::new(Protocol::Tcp, 80, cidr).describe("activation")];
        for (port, label) in [(111, "portmapper"), (2049, "nfs"), (20048, "mountd")] {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                rules.push(IngressRule::new(protocol, port, cidr).describe(label));
            }
        }
        Self { rules }
    }

    /// 送信元・プロトコル・ポートが許可されるか
    pub fn allows(&self, source: Ipv4Addr, protocol: Protocol, port: u16) -> bool {
        self.rules.iter().any(|r| r.matches(source, protocol, port))
    }

    /// リソース属性（JSON）に変換
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.rules).unwrap_or(serde_json::Value::Array(Vec::new()))
    }

    /// リソース属性（JSON）から復元
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let rules: Vec<IngressRule> = serde_json::from_value(value.clone())
            .map_err(|e| FlowError::InvalidConfig(format!("invalid ingress rules: {}", e)))?;
        Ok(Self { rules })
    }
}
