use bitflags::bitflags;

bitflags! {
    /// The operations that can be requested for or granted on a path.
    ///
    /// `RECURSIVE` is only meaningful in the `required` argument of a query,
    /// where it demands the remaining bits on every potential path below the
    /// queried one as well. It is split off before the tree walk and never
    /// stored in a rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Read the contents and history of a path.
        const READ = 0x01;
        /// Modify a path.
        const WRITE = 0x02;
        /// Demand the operation bits on the whole subtree, not just the
        /// queried path itself.
        const RECURSIVE = 0x04;
    }
}

impl Access {
    /// Both operation bits, the full span of what a rule can grant.
    pub const OPERATIONS: Access = Access::READ.union(Access::WRITE);
}
