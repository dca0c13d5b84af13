//! リソース種別

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// リソース種別タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// 仮想アプライアンス（ゲートウェイVM）
    ComputeInstance,
    /// キャッシュ用ブロックボリューム
    BlockVolume,
    /// ボリュームとインスタンスの接続
    VolumeAttachment,
    /// セキュリティグループ（インバウンドルール込み）
    SecurityGroup,
    /// VPCエンドポイント
    NetworkEndpoint,
    /// IAMロール
    Role,
    /// ロールに付与するインラインポリシー
    RolePolicy,
    /// ストレージゲートウェイ
    Gateway,
    /// ゲートウェイのキャッシュディスク割り当て
    GatewayCache,
    /// NFSファイル共有
    FileShare,
    /// バケットのイベント通知設定
    BucketNotification,
    /// イベントルール
    EventRule,
    /// イベントルールのターゲット
    EventTarget,
    /// 通知トピック
    NotificationTopic,
    /// トピックの発行許可ポリシー
    TopicPolicy,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 15] = [
        ResourceKind::ComputeInstance,
        ResourceKind::BlockVolume,
        ResourceKind::VolumeAttachment,
        ResourceKind::SecurityGroup,
        ResourceKind::NetworkEndpoint,
        ResourceKind::Role,
        ResourceKind::RolePolicy,
        ResourceKind::Gateway,
        ResourceKind::GatewayCache,
        ResourceKind::FileShare,
        ResourceKind::BucketNotification,
        ResourceKind::EventRule,
        ResourceKind::EventTarget,
        ResourceKind::NotificationTopic,
        ResourceKind::TopicPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ComputeInstance => "compute-instance",
            ResourceKind::BlockVolume => "block-volume",
            ResourceKind::VolumeAttachment => "volume-attachment",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::NetworkEndpoint => "network-endpoint",
            ResourceKind::Role => "role",
            ResourceKind::RolePolicy => "role-policy",
            ResourceKind::Gateway => "gateway",
            ResourceKind::GatewayCache => "gateway-cache",
            ResourceKind::FileShare => "file-share",
            ResourceKind::BucketNotification => "bucket-notification",
            ResourceKind::EventRule => "event-rule",
            ResourceKind::EventTarget => "event-target",
            ResourceKind::NotificationTopic => "notification-topic",
            ResourceKind::TopicPolicy => "topic-policy",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| FlowError::UnknownResourceKind(s.to_string()))
    }
}
