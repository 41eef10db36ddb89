//! Permissions and the built-in role table.

use std::fmt;

/// A capability checked against a user's roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ClusterRead,
    ClusterManage,
    BucketManage,
    Settings,
    StatsRead,
    UserRead,
    UserManage,
    Select,
    DataRead,
    DataWrite,
    DcpRead,
    ViewsRead,
    ViewsManage,
    QueryRead,
    QueryWrite,
    QueryDelete,
    QueryManage,
    SearchRead,
    SearchManage,
    AnalyticsRead,
    AnalyticsManage,
    ReplicationManage,
    ReplicationTarget,
    SyncGateway,
}

impl Permission {
    /// Every permission, in declaration order.
    pub const ALL: &'static [Permission] = &[
        Permission::ClusterRead,
        Permission::ClusterManage,
        Permission::BucketManage,
        Permission::Settings,
        Permission::StatsRead,
        Permission::UserRead,
        Permission::UserManage,
        Permission::Select,
        Permission::DataRead,
        Permission::DataWrite,
        Permission::DcpRead,
        Permission::ViewsRead,
        Permission::ViewsManage,
        Permission::QueryRead,
        Permission::QueryWrite,
        Permission::QueryDelete,
        Permission::QueryManage,
        Permission::SearchRead,
        Permission::SearchManage,
        Permission::AnalyticsRead,
        Permission::AnalyticsManage,
        Permission::ReplicationManage,
        Permission::ReplicationTarget,
        Permission::SyncGateway,
    ];
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Static description of a role as listed by the roles endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RoleInfo {
    pub role: &'static str,
    pub name: &'static str,
    pub desc: &'static str,
    /// Whether the role takes a `[bucket:scope:collection]` qualifier.
    pub bucket_scoped: bool,
    pub permissions: &'static [Permission],
}

use Permission as P;

/// The role table. Looked up by [`role_info`].
pub const ROLES: &[RoleInfo] = &[
    RoleInfo {
        role: "admin",
        name: "Full Admin",
        desc: "Can manage all cluster features including security.",
        bucket_scoped: false,
        permissions: Permission::ALL,
    },
    RoleInfo {
        role: "ro_admin",
        name: "Read-Only Admin",
        desc: "Can view cluster information but cannot make changes.",
        bucket_scoped: false,
        permissions: &[P::ClusterRead, P::Settings, P::StatsRead, P::UserRead],
    },
    RoleInfo {
        role: "cluster_admin",
        name: "Cluster Admin",
        desc: "Can manage all cluster features except security.",
        bucket_scoped: false,
        permissions: &[
            P::ClusterRead,
            P::ClusterManage,
            P::BucketManage,
            P::Settings,
            P::StatsRead,
            P::ReplicationManage,
        ],
    },
    RoleInfo {
        role: "security_admin",
        name: "Security Admin",
        desc: "Can view all cluster information and manage user roles.",
        bucket_scoped: false,
        permissions: &[P::ClusterRead, P::Settings, P::UserRead, P::UserManage],
    },
    RoleInfo {
        role: "bucket_admin",
        name: "Bucket Admin",
        desc: "Can manage the settings of a bucket.",
        bucket_scoped: true,
        permissions: &[
            P::BucketManage,
            P::ClusterRead,
            P::Settings,
            P::StatsRead,
            P::Select,
            P::ViewsManage,
        ],
    },
    RoleInfo {
        role: "scope_admin",
        name: "Manage Scopes",
        desc: "Can create and drop collections within a scope.",
        bucket_scoped: true,
        permissions: &[P::BucketManage, P::ClusterRead, P::Settings, P::Select],
    },
    RoleInfo {
        role: "bucket_full_access",
        name: "Application Access",
        desc: "Full access to bucket data.",
        bucket_scoped: true,
        permissions: &[
            P::DataRead,
            P::DataWrite,
            P::DcpRead,
            P::Select,
            P::Settings,
            P::StatsRead,
            P::ViewsRead,
            P::QueryRead,
            P::QueryWrite,
            P::QueryDelete,
            P::QueryManage,
            P::SearchRead,
        ],
    },
    RoleInfo {
        role: "views_admin",
        name: "Views Admin",
        desc: "Can create and manage views of a bucket.",
        bucket_scoped: true,
        permissions: &[P::ViewsRead, P::ViewsManage, P::DataRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "views_reader",
        name: "Views Reader",
        desc: "Can read views of a bucket.",
        bucket_scoped: true,
        permissions: &[P::ViewsRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "replication_admin",
        name: "XDCR Admin",
        desc: "Can administer cross-cluster replication.",
        bucket_scoped: false,
        permissions: &[P::ReplicationManage, P::ClusterRead, P::Settings],
    },
    RoleInfo {
        role: "replication_target",
        name: "Replication Target",
        desc: "Can accept incoming replication.",
        bucket_scoped: true,
        permissions: &[P::ReplicationTarget, P::DataRead, P::DataWrite, P::Select, P::Settings],
    },
    RoleInfo {
        role: "data_reader",
        name: "Data Reader",
        desc: "Can read data from a bucket, scope or collection.",
        bucket_scoped: true,
        permissions: &[P::DataRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "data_writer",
        name: "Data Writer",
        desc: "Can write data to a bucket, scope or collection.",
        bucket_scoped: true,
        permissions: &[P::DataWrite, P::Select, P::Settings],
    },
    RoleInfo {
        role: "data_dcp_reader",
        name: "Data DCP Reader",
        desc: "Can open change streams on a bucket.",
        bucket_scoped: true,
        permissions: &[P::DcpRead, P::DataRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "data_backup",
        name: "Data Backup & Restore",
        desc: "Can back up and restore bucket data.",
        bucket_scoped: true,
        permissions: &[P::DataRead, P::DataWrite, P::DcpRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "data_monitoring",
        name: "Data Monitor",
        desc: "Can read statistics of a bucket.",
        bucket_scoped: true,
        permissions: &[P::StatsRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "fts_admin",
        name: "Search Admin",
        desc: "Can administer search indexes.",
        bucket_scoped: true,
        permissions: &[P::SearchRead, P::SearchManage, P::Select, P::Settings],
    },
    RoleInfo {
        role: "fts_searcher",
        name: "Search Reader",
        desc: "Can query search indexes.",
        bucket_scoped: true,
        permissions: &[P::SearchRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_select",
        name: "Query Select",
        desc: "Can execute SELECT statements.",
        bucket_scoped: true,
        permissions: &[P::QueryRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_update",
        name: "Query Update",
        desc: "Can execute UPDATE statements.",
        bucket_scoped: true,
        permissions: &[P::QueryWrite, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_insert",
        name: "Query Insert",
        desc: "Can execute INSERT statements.",
        bucket_scoped: true,
        permissions: &[P::QueryWrite, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_delete",
        name: "Query Delete",
        desc: "Can execute DELETE statements.",
        bucket_scoped: true,
        permissions: &[P::QueryDelete, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_manage_index",
        name: "Query Manage Index",
        desc: "Can manage query indexes.",
        bucket_scoped: true,
        permissions: &[P::QueryManage, P::Select, P::Settings],
    },
    RoleInfo {
        role: "query_system_catalog",
        name: "Query System Catalog",
        desc: "Can look up system catalog information.",
        bucket_scoped: false,
        permissions: &[P::QueryRead, P::ClusterRead],
    },
    RoleInfo {
        role: "query_external_access",
        name: "Query CURL Access",
        desc: "Can execute CURL statements.",
        bucket_scoped: false,
        permissions: &[P::QueryRead],
    },
    RoleInfo {
        role: "analytics_manager",
        name: "Analytics Manager",
        desc: "Can manage analytics links and datasets of a bucket.",
        bucket_scoped: true,
        permissions: &[P::AnalyticsManage, P::AnalyticsRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "analytics_reader",
        name: "Analytics Reader",
        desc: "Can query analytics datasets.",
        bucket_scoped: false,
        permissions: &[P::AnalyticsRead, P::Settings],
    },
    RoleInfo {
        role: "analytics_select",
        name: "Analytics Select",
        desc: "Can query analytics datasets of a bucket.",
        bucket_scoped: true,
        permissions: &[P::AnalyticsRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "analytics_admin",
        name: "Analytics Admin",
        desc: "Can manage the analytics service.",
        bucket_scoped: false,
        permissions: &[P::AnalyticsManage, P::AnalyticsRead, P::ClusterRead, P::Settings],
    },
    RoleInfo {
        role: "mobile_sync_gateway",
        name: "Sync Gateway",
        desc: "Full access to bucket data as required by Sync Gateway.",
        bucket_scoped: true,
        permissions: &[P::SyncGateway, P::DataRead, P::DataWrite, P::DcpRead, P::Select, P::Settings],
    },
    RoleInfo {
        role: "external_stats_reader",
        name: "External Stats Reader",
        desc: "Can read statistics through the metrics endpoint.",
        bucket_scoped: false,
        permissions: &[P::StatsRead],
    },
];

/// Look up a role by its identifier.
pub fn role_info(role: &str) -> Option<&'static RoleInfo> {
    ROLES.iter().find(|info| info.role == role)
}

/// Permissions granted by a role, empty for unknown roles.
pub fn role_permissions(role: &str) -> &'static [Permission] {
    role_info(role).map(|info| info.permissions).unwrap_or_default()
}
