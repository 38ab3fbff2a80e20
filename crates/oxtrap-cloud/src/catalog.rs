//! Default metric catalogs for the built-in CloudWatch namespaces.

use oxtrap_common::types::{DestinationKind, MetricDefinition, Statistic};

use oxtrap_common::types::Statistic::{Average as AVG, Maximum as MAX, Minimum as MIN, SampleCount as CNT, Sum as SUM};

type Row = (&'static str, &'static [Statistic], &'static str);

const ALL: &[Statistic] = &[MIN, MAX, AVG, SUM, CNT];
const DIST: &[Statistic] = &[AVG, MIN, MAX, SUM];
const SPREAD: &[Statistic] = &[AVG, MIN, MAX, CNT];

const EC2: &[Row] = &[
    ("CPUUtilization", &[AVG], "Percent"),
    ("DiskReadOps", &[AVG], "Count"),
    ("DiskWriteOps", &[AVG], "Count"),
    ("DiskReadBytes", &[AVG], "Bytes"),
    ("DiskWriteBytes", &[AVG], "Bytes"),
    ("NetworkIn", &[AVG], "Bytes"),
    ("NetworkOut", &[AVG], "Bytes"),
    ("NetworkPacketsIn", &[AVG], "Count"),
    ("NetworkPacketsOut", &[AVG], "Count"),
    ("EBSReadOps", &[AVG], "Count"),
    ("EBSWriteOps", &[AVG], "Count"),
    ("EBSReadBytes", &[AVG], "Bytes"),
    ("EBSWriteBytes", &[AVG], "Bytes"),
];

const EBS: &[Row] = &[
    ("VolumeReadBytes", ALL, "Bytes"),
    ("VolumeWriteBytes", ALL, "Bytes"),
    ("VolumeReadOps", ALL, "Count"),
    ("VolumeWriteOps", ALL, "Count"),
    ("VolumeTotalReadTime", ALL, "Seconds"),
    ("VolumeTotalWriteTime", ALL, "Seconds"),
    ("VolumeIdleTime", ALL, "Seconds"),
    ("VolumeQueueLength", ALL, "Count"),
];

const RDS: &[Row] = &[
    ("BinLogDiskUsage", &[AVG], "Bytes"),
    ("BurstBalance", &[AVG], "Percent"),
    ("CPUUtilization", &[AVG], "Percent"),
    ("CPUCreditUsage", &[AVG], "Credits"),
    ("CPUCreditBalance", &[AVG], "Credits"),
    ("DatabaseConnections", &[AVG], "Count"),
    ("DiskQueueDepth", &[AVG], "Count"),
    ("FreeableMemory", &[AVG], "Bytes"),
    ("FreeStorageSpace", &[AVG], "Bytes"),
    ("MaximumUsedTransactionIDs", &[AVG], "Count"),
    ("NetworkReceiveThroughput", &[AVG], "Bytes"),
    ("NetworkTransmitThroughput", &[AVG], "Bytes"),
    ("OldestReplicationSlotLag", &[AVG], "Megabytes"),
    ("ReadIOPS", &[AVG], "Count"),
    ("ReadLatency", &[AVG], "Seconds"),
    ("ReadThroughput", &[AVG], "Bytes"),
    ("ReplicaLag", &[AVG], "Seconds"),
    ("ReplicationSlotDiskUsage", &[AVG], "Megabytes"),
    ("SwapUsage", &[AVG], "Bytes"),
    ("TransactionLogDiskUsage", &[AVG], "Megabytes"),
    ("TransactionLogsGeneration", &[AVG], "Megabytes"),
    ("WriteIOPS", &[AVG], "Count"),
    ("WriteLatency", &[AVG], "Seconds"),
    ("WriteThroughput", &[AVG], "Bytes"),
];

const S3: &[Row] = &[
    ("BucketSizeBytes", &[AVG], "Bytes"),
    ("NumberOfObjects", &[AVG], "Count"),
    ("AllRequests", &[MIN], "Count"),
    ("GetRequests", &[MIN], "Count"),
    ("PutRequests", &[MIN], "Count"),
    ("DeleteRequests", &[MIN], "Count"),
    ("HeadRequests", &[MIN], "Count"),
    ("PostRequests", &[MIN], "Count"),
    ("ListRequests", &[MIN], "Count"),
    ("SelectRequests", &[MIN], "Count"),
    ("SelectScannedBytes", SPREAD, "Bytes"),
    ("SelectReturnedBytes", SPREAD, "Bytes"),
    ("BytesDownloaded", SPREAD, "Bytes"),
    ("BytesUploaded", SPREAD, "Bytes"),
    ("4xxErrors", SPREAD, "Count"),
    ("5xxErrors", SPREAD, "Count"),
    ("FirstByteLatency", SPREAD, "Milliseconds"),
    ("TotalRequestLatency", SPREAD, "Milliseconds"),
];

const SQS: &[Row] = &[
    ("ApproximateAgeOfOldestMessage", DIST, "Seconds"),
    ("ApproximateNumberOfMessagesDelayed", ALL, "Count"),
    ("ApproximateNumberOfMessagesNotVisible", ALL, "Count"),
    ("ApproximateNumberOfMessagesVisible", ALL, "Count"),
    ("NumberOfEmptyReceives", ALL, "Count"),
    ("NumberOfMessagesDeleted", ALL, "Count"),
    ("NumberOfMessagesReceived", ALL, "Count"),
    ("NumberOfMessagesSent", ALL, "Count"),
    ("SentMessageSize", DIST, "Bytes"),
];

/// A built-in namespace.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub namespace: &'static str,
    /// Dimension that identifies one resource of this namespace.
    pub resource_dimension: &'static str,
    rows: &'static [Row],
}

impl CatalogEntry {
    pub fn default_metrics(&self) -> Vec<MetricDefinition> {
        self.rows
            .iter()
            .map(|(name, stats, units)| MetricDefinition::new(name, stats, units, DestinationKind::Gauge))
            .collect()
    }
}

const ENTRIES: &[CatalogEntry] = &[
    CatalogEntry { namespace: "AWS/EC2", resource_dimension: "InstanceId", rows: EC2 },
    CatalogEntry { namespace: "AWS/EBS", resource_dimension: "VolumeId", rows: EBS },
    CatalogEntry { namespace: "AWS/RDS", resource_dimension: "DBInstanceIdentifier", rows: RDS },
    CatalogEntry { namespace: "AWS/S3", resource_dimension: "BucketName", rows: S3 },
    CatalogEntry { namespace: "AWS/SQS", resource_dimension: "QueueName", rows: SQS },
];

/// Finds a built-in namespace, ignoring case.
pub fn lookup(namespace: &str) -> Option<&'static CatalogEntry> {
    ENTRIES
        .iter()
        .find(|e| e.namespace.eq_ignore_ascii_case(namespace.trim()))
}

pub fn namespaces() -> impl Iterator<Item = &'static str> {
    ENTRIES.iter().map(|e| e.namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_find_namespace_case_insensitively() {
        let entry = lookup("aws/ec2").unwrap();
        assert_eq!(entry.namespace, "AWS/EC2");
        assert_eq!(entry.resource_dimension, "InstanceId");
        assert!(lookup("AWS/Lambda").is_none());
    }

    #[test]
    fn should_ship_non_empty_catalogs_with_units() {
        for ns in namespaces() {
            let metrics = lookup(ns).unwrap().default_metrics();
            assert!(!metrics.is_empty(), "{ns}");
            assert!(metrics.iter().all(|m| !m.provider.stats.is_empty() && !m.provider.units.is_empty()));
        }
    }
}
