mod direct_fragmentation;
mod lvm_pools;
