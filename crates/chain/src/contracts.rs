//! Solidity bindings for the three remote contracts the engine depends on.
//!
//! Only the functions the engine calls are declared. `getReserveData` is the
//! protocol's full 12-field tuple; the client consumes the three rate fields
//! and ignores the rest.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IPool {
        function getUserAccountData(address user)
            external
            view
            returns (
                uint256 totalCollateralBase,
                uint256 totalDebtBase,
                uint256 availableBorrowsBase,
                uint256 currentLiquidationThreshold,
                uint256 ltv,
                uint256 healthFactor
            );

        function getReservesList() external view returns (address[] memory);
    }

    #[sol(rpc)]
    interface IPoolDataProvider {
        function getReserveTokensAddresses(address asset)
            external
            view
            returns (
                address aTokenAddress,
                address stableDebtTokenAddress,
                address variableDebtTokenAddress
            );

        function getReserveData(address asset)
            external
            view
            returns (
                uint256 unbacked,
                uint256 accruedToTreasuryScaled,
                uint256 totalAToken,
                uint256 totalStableDebt,
                uint256 totalVariableDebt,
                uint256 liquidityRate,
                uint256 variableBorrowRate,
                uint256 stableBorrowRate,
                uint256 averageStableBorrowRate,
                uint256 liquidityIndex,
                uint256 variableBorrowIndex,
                uint40 lastUpdateTimestamp
            );
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function symbol() external view returns (string memory);
        function decimals() external view returns (uint8);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }

    /// Entry point of the external flash-loan rebalance contract. Its
    /// internal debt-repayment logic lives behind this fixed interface.
    #[sol(rpc)]
    interface IRebalanceExecutor {
        function rebalance(address user, address asset) external;
    }
}
